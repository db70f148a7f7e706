//! Code-enforced risk caps. These run after parsing and override whatever
//! the model asked for; the advisory limits (leverage, R:R, confidence) are
//! prompt-side only and deliberately not rewritten here.

use tracing::info;

use crate::models::{is_btc_eth, AccountSnapshot, TradeAction, TradeDecision};
use crate::store::{Position, RiskConfig};

const DEFAULT_POSITION_PCT: f64 = 0.2;
const DEFAULT_LEVERAGE: u32 = 5;

/// A decision that survived the caps, with its concrete order size.
#[derive(Debug, Clone)]
pub struct SizedDecision {
    pub decision: TradeDecision,
    /// Notional USD for openings; 0 for closes.
    pub size_usd: f64,
    pub leverage: u32,
}

/// Same-cycle conflict resolution: for each symbol the later entry wins,
/// except a close always beats an open. `hold`/`wait` entries are dropped.
pub fn resolve_conflicts(decisions: Vec<TradeDecision>) -> Vec<TradeDecision> {
    let mut out: Vec<TradeDecision> = Vec::new();
    for d in decisions {
        if d.action.is_noop() {
            continue;
        }
        if let Some(existing) = out.iter_mut().find(|e| e.symbol == d.symbol) {
            if existing.action.is_close() && d.action.is_open() {
                continue;
            }
            *existing = d;
        } else {
            out.push(d);
        }
    }
    out
}

/// Apply the hard caps. Returns the surviving sized decisions plus the audit
/// log lines recorded on the decision record.
pub fn enforce_risk(
    decisions: Vec<TradeDecision>,
    account: &AccountSnapshot,
    open_positions: &[Position],
    risk: &RiskConfig,
) -> (Vec<SizedDecision>, Vec<String>) {
    let mut approved = Vec::new();
    let mut log = Vec::new();

    let equity = account.total_equity.max(0.0);
    let mut open_count = open_positions.len();
    let mut projected_margin = account.margin_used_pct.max(0.0) / 100.0 * equity;

    for d in resolve_conflicts(decisions) {
        if d.action.is_close() {
            let holds = open_positions
                .iter()
                .any(|p| p.symbol == d.symbol && Some(p.side) == d.action.side());
            if !holds {
                log.push(format!("{}: {} skipped, no open position", d.symbol, d.action.as_str()));
                continue;
            }
            approved.push(SizedDecision {
                decision: d,
                size_usd: 0.0,
                leverage: 0,
            });
            continue;
        }

        // Opening path.
        if open_count >= risk.max_positions {
            log.push(format!(
                "{}: blocked, open position cap {} reached",
                d.symbol, risk.max_positions
            ));
            continue;
        }
        if open_positions
            .iter()
            .any(|p| p.symbol == d.symbol && Some(p.side) == d.action.side())
        {
            log.push(format!(
                "{}: blocked, already holding {}",
                d.symbol,
                d.action.side().map(|s| s.as_str()).unwrap_or("?")
            ));
            continue;
        }

        let class_ratio = if is_btc_eth(&d.symbol) {
            risk.btc_eth_max_position_value_ratio
        } else {
            risk.altcoin_max_position_value_ratio
        };
        let max_size = equity * class_ratio;

        let pct = d.position_pct.unwrap_or(DEFAULT_POSITION_PCT).max(0.0);
        let mut size_usd = account.available_balance.max(0.0) * pct;
        if size_usd > max_size {
            log.push(format!(
                "{}: size {:.2} capped to {:.2} ({}x equity class limit)",
                d.symbol, size_usd, max_size, class_ratio
            ));
            size_usd = max_size;
        }
        if size_usd < risk.min_position_size_usd {
            size_usd = risk.min_position_size_usd;
        }
        if size_usd > max_size && max_size > 0.0 {
            // min floor cannot break the class cap
            size_usd = max_size;
        }

        let leverage = d.leverage.unwrap_or(DEFAULT_LEVERAGE).max(1);
        let added_margin = size_usd / leverage as f64;
        if equity > 0.0 && (projected_margin + added_margin) / equity > risk.max_margin_usage {
            log.push(format!(
                "{}: blocked, margin usage would exceed {:.0}%",
                d.symbol,
                risk.max_margin_usage * 100.0
            ));
            continue;
        }

        projected_margin += added_margin;
        open_count += 1;
        log.push(format!(
            "{}: {} approved, {:.2} USD at {}x",
            d.symbol,
            d.action.as_str(),
            size_usd,
            leverage
        ));
        approved.push(SizedDecision {
            decision: d,
            size_usd,
            leverage,
        });
    }

    if !log.is_empty() {
        info!(lines = log.len(), "risk enforcement applied");
    }
    (approved, log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionSide, PositionStatus};

    fn decision(symbol: &str, action: TradeAction) -> TradeDecision {
        TradeDecision {
            symbol: symbol.to_string(),
            action,
            confidence: 80.0,
            leverage: None,
            position_pct: None,
            stop_loss: None,
            take_profit: None,
            reasoning: None,
        }
    }

    fn open_pos(symbol: &str, side: PositionSide) -> Position {
        Position {
            id: "p".to_string(),
            trader_id: "t1".to_string(),
            exchange_id: "e1".to_string(),
            venue: "binance".to_string(),
            exchange_position_id: String::new(),
            symbol: symbol.to_string(),
            side,
            entry_qty: 1.0,
            qty: 1.0,
            entry_price: 100.0,
            entry_order_id: String::new(),
            entry_time: 1,
            exit_price: 0.0,
            exit_order_id: String::new(),
            exit_time: 0,
            realized_pnl: 0.0,
            fee: 0.0,
            leverage: 5,
            status: PositionStatus::Open,
            close_reason: String::new(),
            source: "system".to_string(),
        }
    }

    fn account(equity: f64) -> AccountSnapshot {
        AccountSnapshot {
            total_equity: equity,
            available_balance: equity,
            unrealized_pnl: 0.0,
            margin_used_pct: 0.0,
            position_count: 0,
        }
    }

    #[test]
    fn later_entry_wins_but_close_beats_open() {
        let resolved = resolve_conflicts(vec![
            decision("BTCUSDT", TradeAction::OpenLong),
            decision("BTCUSDT", TradeAction::OpenShort),
            decision("ETHUSDT", TradeAction::CloseLong),
            decision("ETHUSDT", TradeAction::OpenLong),
            decision("SOLUSDT", TradeAction::Hold),
        ]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].action, TradeAction::OpenShort);
        assert_eq!(resolved[1].action, TradeAction::CloseLong);
    }

    #[test]
    fn position_count_cap_blocks_new_opens() {
        let positions = vec![
            open_pos("BTCUSDT", PositionSide::Long),
            open_pos("ETHUSDT", PositionSide::Long),
            open_pos("SOLUSDT", PositionSide::Short),
        ];
        let risk = RiskConfig {
            max_positions: 3,
            ..Default::default()
        };
        let (approved, log) = enforce_risk(
            vec![decision("AVAXUSDT", TradeAction::OpenLong)],
            &account(500.0),
            &positions,
            &risk,
        );
        assert!(approved.is_empty());
        assert!(log[0].contains("cap 3 reached"));
    }

    #[test]
    fn oversized_altcoin_position_is_capped() {
        let risk = RiskConfig {
            altcoin_max_position_value_ratio: 1.0,
            ..Default::default()
        };
        let mut d = decision("AVAXUSDT", TradeAction::OpenLong);
        // even an unclamped 5.0 from upstream cannot exceed the class limit
        d.position_pct = Some(5.0);
        let (approved, _) = enforce_risk(vec![d], &account(1000.0), &[], &risk);
        assert_eq!(approved.len(), 1);
        assert!(approved[0].size_usd <= 1000.0);
    }

    #[test]
    fn minimum_size_floor() {
        let risk = RiskConfig::default();
        let mut d = decision("AVAXUSDT", TradeAction::OpenLong);
        d.position_pct = Some(0.001);
        let (approved, _) = enforce_risk(vec![d], &account(1000.0), &[], &risk);
        assert_eq!(approved[0].size_usd, 12.0);
    }

    #[test]
    fn margin_ceiling_blocks() {
        let risk = RiskConfig {
            max_margin_usage: 0.1,
            ..Default::default()
        };
        let mut d = decision("BTCUSDT", TradeAction::OpenLong);
        d.position_pct = Some(1.0);
        d.leverage = Some(1);
        let (approved, log) = enforce_risk(vec![d], &account(1000.0), &[], &risk);
        assert!(approved.is_empty());
        assert!(log.iter().any(|l| l.contains("margin usage")));
    }

    #[test]
    fn close_requires_matching_position() {
        let positions = vec![open_pos("BTCUSDT", PositionSide::Long)];
        let (approved, _) = enforce_risk(
            vec![
                decision("BTCUSDT", TradeAction::CloseLong),
                decision("ETHUSDT", TradeAction::CloseShort),
            ],
            &account(1000.0),
            &positions,
            &RiskConfig::default(),
        );
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].decision.symbol, "BTCUSDT");
    }
}
