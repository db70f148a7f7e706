//! Prompt assembly.
//!
//! The system prompt concatenates the strategy's editable sections with a
//! variant preamble; the user prompt is a deterministic rendering of the
//! cycle context so identical market states produce identical prompts.

use std::fmt::Write as _;

use crate::market::TradeContext;
use crate::models::PromptVariant;
use crate::store::{RiskConfig, StrategyConfig};

fn variant_preamble(variant: PromptVariant, zh: bool) -> &'static str {
    match (variant, zh) {
        (PromptVariant::Balanced, false) => {
            "Style: balanced. Weigh opportunity against drawdown; only act on clear setups."
        }
        (PromptVariant::Aggressive, false) => {
            "Style: aggressive. Prefer momentum entries and accept larger drawdowns for larger targets."
        }
        (PromptVariant::Conservative, false) => {
            "Style: conservative. Capital preservation first; skip anything marginal."
        }
        (PromptVariant::Scalping, false) => {
            "Style: scalping. Short holding periods, tight stops, quick profit taking."
        }
        (PromptVariant::Balanced, true) => "风格：均衡。机会与回撤并重，只在明确信号时行动。",
        (PromptVariant::Aggressive, true) => "风格：激进。偏好动量入场，接受更大回撤换取更大目标。",
        (PromptVariant::Conservative, true) => "风格：保守。以保全本金为先，放弃边际机会。",
        (PromptVariant::Scalping, true) => "风格：短线。持仓时间短，止损紧，快速止盈。",
    }
}

fn default_role(zh: bool) -> &'static str {
    if zh {
        "你是一名管理永续合约账户的自主交易员。"
    } else {
        "You are an autonomous futures trader managing one perpetual-futures account."
    }
}

fn output_contract() -> &'static str {
    "Respond with a <reasoning>...</reasoning> block followed by a <decision>[...]</decision> \
     block. The decision block is a JSON array; each entry has symbol, action \
     (open_long|open_short|close_long|close_short|hold|wait), confidence (0-100), and for \
     openings: leverage, position_pct (0-1], stop_loss and take_profit as fractions of entry \
     (0.03 = 3%)."
}

fn risk_section(risk: &RiskConfig) -> String {
    format!(
        "Hard limits enforced in code: at most {} open positions, margin usage <= {:.0}%, \
         minimum position {:.0} USD. Respect advisory limits: leverage <= {}x on BTC/ETH and \
         <= {}x on altcoins, risk:reward >= {:.1}, only act above {:.0} confidence.",
        risk.max_positions,
        risk.max_margin_usage * 100.0,
        risk.min_position_size_usd,
        risk.max_leverage_btc_eth,
        risk.max_leverage_altcoin,
        risk.min_risk_reward,
        risk.min_confidence
    )
}

/// System prompt = role + frequency + entry standards + decision process +
/// risk limits + variant tag + output contract. `custom_override` (a
/// per-trader scratch prompt) replaces the strategy sections when set.
pub fn build_system_prompt(cfg: &StrategyConfig, custom_override: Option<&str>) -> String {
    let zh = cfg.language.eq_ignore_ascii_case("zh");
    let mut out = String::new();

    if let Some(custom) = custom_override.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str(custom);
    } else {
        let sections = [
            (&cfg.prompts.role, default_role(zh)),
            (&cfg.prompts.trading_frequency, ""),
            (&cfg.prompts.entry_standards, ""),
            (&cfg.prompts.decision_process, ""),
        ];
        for (section, fallback) in sections {
            let text = if section.trim().is_empty() {
                fallback
            } else {
                section.trim()
            };
            if !text.is_empty() {
                out.push_str(text);
                out.push_str("\n\n");
            }
        }
        out.push_str(&risk_section(&cfg.risk));
    }

    out.push_str("\n\n");
    out.push_str(variant_preamble(cfg.variant, zh));
    out.push_str("\n\n");
    out.push_str(output_contract());
    out
}

/// Deterministic context rendering.
pub fn build_user_prompt(ctx: &TradeContext) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Time: {}", ctx.now_utc);
    let _ = writeln!(
        out,
        "Cycle: {} (uptime {}s)",
        ctx.cycle_number, ctx.uptime_secs
    );
    let _ = writeln!(
        out,
        "Account: equity {:.2} USD, available {:.2} USD, unrealized {:.2} USD, margin used {:.1}%",
        ctx.account.total_equity,
        ctx.account.available_balance,
        ctx.account.unrealized_pnl,
        ctx.account.margin_used_pct
    );

    if ctx.positions.is_empty() {
        let _ = writeln!(out, "Open positions: none");
    } else {
        let _ = writeln!(out, "Open positions:");
        for pos in &ctx.positions {
            let _ = writeln!(
                out,
                "- {} {} qty {:.4} @ {:.2} (lev {}x, realized {:.2})",
                pos.symbol,
                pos.side.as_str(),
                pos.qty,
                pos.entry_price,
                pos.leverage,
                pos.realized_pnl
            );
        }
    }

    let _ = writeln!(out, "Candidates: {}", ctx.candidates.join(", "));

    let mut symbols: Vec<&String> = ctx.market.keys().collect();
    symbols.sort();
    for symbol in symbols {
        let data = &ctx.market[symbol];
        let _ = writeln!(out, "\n## {symbol} (last {:.4})", data.last_price);

        let mut intervals: Vec<&String> = data.klines.keys().collect();
        intervals.sort();
        for interval in intervals {
            let klines = &data.klines[interval];
            let Some(last) = klines.last() else { continue };
            let first = &klines[0];
            let change_pct = if first.open > 0.0 {
                (last.close - first.open) / first.open * 100.0
            } else {
                0.0
            };
            let _ = write!(
                out,
                "{interval}: close {:.4} ({:+.2}% over {} bars), range {:.4}-{:.4}",
                last.close,
                change_pct,
                klines.len(),
                klines.iter().map(|k| k.low).fold(f64::INFINITY, f64::min),
                klines.iter().map(|k| k.high).fold(0.0f64, f64::max),
            );

            if let Some(series) = data.indicators.get(interval) {
                let mut periods: Vec<&usize> = series.ema.keys().collect();
                periods.sort();
                for period in periods {
                    if let Some(v) = series.ema[period].last() {
                        let _ = write!(out, ", EMA{period} {v:.4}");
                    }
                }
                let mut rsi_periods: Vec<&usize> = series.rsi.keys().collect();
                rsi_periods.sort();
                for period in rsi_periods {
                    if let Some(v) = series.rsi[period].last() {
                        let _ = write!(out, ", RSI{period} {v:.1}");
                    }
                }
                if let Some(macd) = &series.macd {
                    if let (Some(m), Some(s)) = (macd.macd.last(), macd.signal.last()) {
                        let _ = write!(out, ", MACD {m:.4}/{s:.4}");
                    }
                }
            }
            let _ = writeln!(out);
        }

        if let Some(rate) = data.funding_rate {
            let _ = writeln!(out, "funding rate: {:.5}", rate);
        }
        if let Some(quant) = ctx.quant.get(symbol) {
            let _ = writeln!(
                out,
                "quant: OI {:+.2}%, net flow {:+.0} USD, price {:+.2}%",
                quant.oi_delta_pct, quant.net_flow_usd, quant.price_change_pct
            );
        }
    }

    let rankings = [
        ("OI change", &ctx.rankings.oi_change),
        ("Net flow", &ctx.rankings.net_flow),
        ("Price change", &ctx.rankings.price_change),
    ];
    for (label, rows) in rankings {
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{label} leaders:");
        for row in rows {
            let _ = writeln!(
                out,
                "- {} {:+.2}% @ {:.4}",
                row.base_coin, row.change, row.price
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountSnapshot;

    #[test]
    fn system_prompt_carries_variant_and_contract() {
        let cfg = StrategyConfig {
            variant: PromptVariant::Scalping,
            ..Default::default()
        };
        let prompt = build_system_prompt(&cfg, None);
        assert!(prompt.contains("scalping") || prompt.contains("Scalping"));
        assert!(prompt.contains("<decision>"));
        assert!(prompt.contains("at most 3 open positions"));
    }

    #[test]
    fn custom_override_replaces_sections() {
        let cfg = StrategyConfig::default();
        let prompt = build_system_prompt(&cfg, Some("You are a test harness."));
        assert!(prompt.starts_with("You are a test harness."));
        assert!(prompt.contains("<decision>"));
    }

    #[test]
    fn user_prompt_is_deterministic() {
        let ctx = TradeContext {
            now_utc: "2026-01-01 00:00:00 UTC".to_string(),
            cycle_number: 3,
            account: AccountSnapshot {
                total_equity: 1000.0,
                available_balance: 900.0,
                ..Default::default()
            },
            candidates: vec!["BTCUSDT".to_string()],
            ..Default::default()
        };
        let a = build_user_prompt(&ctx);
        let b = build_user_prompt(&ctx);
        assert_eq!(a, b);
        assert!(a.contains("Cycle: 3"));
        assert!(a.contains("Open positions: none"));
    }
}
