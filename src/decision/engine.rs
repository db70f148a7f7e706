//! One decision cycle: context → prompts → model → parse → risk caps →
//! orders → persistence. Failures are recorded, never thrown past the cycle.

use anyhow::{anyhow, Context as _, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

use super::{parser, prompt, risk};
use crate::exchange::{ExchangeAdapter, OrderRequest, OrderSide};
use crate::llm::ModelClient;
use crate::market::ContextBuilder;
use crate::models::{round2, round4, PositionSide, TradeAction};
use crate::reconcile::Reconciler;
use crate::store::{DecisionRecord, OrderRecord, EquitySnapshot, Store, StrategyConfig, Trader};

#[derive(Clone)]
pub struct CycleDeps {
    pub store: Store,
    pub context: Arc<ContextBuilder>,
    pub client: Arc<dyn ModelClient>,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub reconciler: Reconciler,
    pub model_timeout: Duration,
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub record: DecisionRecord,
    pub orders_submitted: usize,
}

/// Execute the full pipeline for one tick. The returned record has already
/// been persisted, alongside an equity snapshot.
pub async fn run_cycle(
    deps: &CycleDeps,
    trader: &Trader,
    cfg: &StrategyConfig,
    cycle_number: u64,
    uptime_secs: u64,
    custom_prompt: Option<&str>,
) -> CycleOutcome {
    let started = chrono::Utc::now().timestamp_millis();
    let mut record = DecisionRecord {
        trader_id: trader.id.clone(),
        cycle_number,
        created_at: started,
        ..Default::default()
    };
    let mut orders_submitted = 0usize;

    match cycle_inner(
        deps,
        trader,
        cfg,
        cycle_number,
        uptime_secs,
        custom_prompt,
        &mut record,
    )
    .await
    {
        Ok(submitted) => {
            record.success = true;
            orders_submitted = submitted;
        }
        Err(e) => {
            record.success = false;
            record.error_message = format!("{e:#}");
            warn!(trader = %trader.name, cycle = cycle_number, error = %e, "cycle failed");
        }
    }

    if let Err(e) = deps.store.insert_decision_record(record.clone()).await {
        warn!(trader = %trader.name, error = %e, "could not persist decision record");
    }
    if let Err(e) = snapshot_equity(deps, trader).await {
        warn!(trader = %trader.name, error = %e, "could not persist equity snapshot");
    }

    CycleOutcome {
        record,
        orders_submitted,
    }
}

async fn cycle_inner(
    deps: &CycleDeps,
    trader: &Trader,
    cfg: &StrategyConfig,
    cycle_number: u64,
    uptime_secs: u64,
    custom_prompt: Option<&str>,
    record: &mut DecisionRecord,
) -> Result<usize> {
    let account = deps
        .adapter
        .account_info()
        .await
        .context("account snapshot")?;
    let positions = deps.store.list_open_positions(&trader.id).await?;

    let ctx = deps
        .context
        .build(cfg, account.clone(), positions.clone(), cycle_number, uptime_secs)
        .await?;
    if ctx.candidates.is_empty() {
        return Err(anyhow!("no candidate coins for this cycle"));
    }
    record.candidate_coins = ctx.candidates.clone();

    let system_prompt = prompt::build_system_prompt(cfg, custom_prompt);
    let user_prompt = prompt::build_user_prompt(&ctx);
    record.system_prompt = system_prompt.clone();
    record.input_prompt = user_prompt.clone();

    let ai_started = Instant::now();
    let response = timeout(
        deps.model_timeout,
        deps.client.call(&system_prompt, &user_prompt),
    )
    .await
    .map_err(|_| anyhow!("model call exceeded {:?}", deps.model_timeout))?
    .context("model call")?;
    record.ai_request_duration_ms = ai_started.elapsed().as_millis() as u64;
    record.raw_response = response.clone();

    let fallback_symbol = (ctx.candidates.len() == 1).then(|| ctx.candidates[0].clone());
    let parsed = parser::parse_response(&response, fallback_symbol.as_deref());
    record.chain_of_thought = parsed.chain_of_thought.clone().unwrap_or_default();
    record.decision_json = serde_json::to_string(&parsed.decisions).unwrap_or_default();
    record.decisions = parsed.decisions.clone();

    let (approved, mut log) = risk::enforce_risk(parsed.decisions, &account, &positions, &cfg.risk);

    let submitted = execute_sized(deps, trader, &ctx.market, &approved, &mut log).await;
    record.execution_log = log;
    Ok(submitted)
}

/// Submit the surviving decisions. Per-order failures land in the log, the
/// cycle carries on.
pub async fn execute_sized(
    deps: &CycleDeps,
    trader: &Trader,
    market: &std::collections::HashMap<String, crate::market::MarketData>,
    approved: &[risk::SizedDecision],
    log: &mut Vec<String>,
) -> usize {
    let mut submitted = 0usize;

    for sized in approved {
        match submit_one(deps, trader, market, sized).await {
            Ok(line) => {
                submitted += 1;
                log.push(line);
            }
            Err(e) => {
                log.push(format!(
                    "{}: submission failed: {e:#}",
                    sized.decision.symbol
                ));
            }
        }
    }

    // Pull whatever the venue reported back into the ledger right away.
    if submitted > 0 {
        if let Err(e) = deps
            .reconciler
            .sync_fills(&trader.id, &trader.exchange_account_id, &deps.adapter)
            .await
        {
            warn!(trader = %trader.name, error = %e, "post-submit fill sync failed");
        }
    }
    submitted
}

async fn submit_one(
    deps: &CycleDeps,
    trader: &Trader,
    market: &std::collections::HashMap<String, crate::market::MarketData>,
    sized: &risk::SizedDecision,
) -> Result<String> {
    let d = &sized.decision;
    let side = d
        .action
        .side()
        .ok_or_else(|| anyhow!("{} is not executable", d.action.as_str()))?;

    let mark = match market.get(&d.symbol) {
        Some(data) if data.last_price > 0.0 => data.last_price,
        _ => deps.adapter.mark_price(&d.symbol).await?,
    };

    let (order_side, qty, reduce_only) = match d.action {
        TradeAction::OpenLong => (OrderSide::Buy, round4(sized.size_usd / mark), false),
        TradeAction::OpenShort => (OrderSide::Sell, round4(sized.size_usd / mark), false),
        TradeAction::CloseLong | TradeAction::CloseShort => {
            let pos = deps
                .store
                .find_open_position(&trader.id, &d.symbol, side)
                .await?
                .ok_or_else(|| anyhow!("no open position to close"))?;
            let order_side = if side == PositionSide::Long {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            (order_side, pos.qty, true)
        }
        _ => return Err(anyhow!("noop action reached submission")),
    };
    if !(qty > 0.0) {
        return Err(anyhow!("computed qty is zero at mark {mark}"));
    }

    // Fractional distances become absolute trigger prices relative to mark.
    let (stop_loss, take_profit) = if d.action.is_open() {
        let sl = d.stop_loss.map(|f| match side {
            PositionSide::Long => round2(mark * (1.0 - f)),
            PositionSide::Short => round2(mark * (1.0 + f)),
        });
        let tp = d.take_profit.map(|f| match side {
            PositionSide::Long => round2(mark * (1.0 + f)),
            PositionSide::Short => round2(mark * (1.0 - f)),
        });
        (sl, tp)
    } else {
        (None, None)
    };

    let req = OrderRequest {
        client_order_id: format!("fb-{}", uuid::Uuid::new_v4().simple()),
        symbol: d.symbol.clone(),
        side: order_side,
        position_side: side,
        order_type: "MARKET".to_string(),
        tif: "GTC".to_string(),
        qty,
        price: None,
        leverage: sized.leverage.max(1),
        reduce_only,
        stop_loss,
        take_profit,
    };

    let ack = deps.adapter.place_order(&req).await.context("place order")?;
    let now = chrono::Utc::now().timestamp_millis();
    deps.store
        .insert_order(OrderRecord {
            id: String::new(),
            trader_id: trader.id.clone(),
            exchange_id: trader.exchange_account_id.clone(),
            venue: deps.adapter.venue().as_str().to_string(),
            exchange_order_id: ack.exchange_order_id.clone(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side.as_str().to_string(),
            position_side: req.position_side,
            order_type: req.order_type.clone(),
            tif: req.tif.clone(),
            qty: req.qty,
            price: 0.0,
            stop_price: 0.0,
            status: ack.status.clone(),
            filled_qty: ack.filled_qty,
            avg_fill_price: round2(ack.avg_price),
            commission: ack.commission,
            leverage: req.leverage,
            reduce_only: req.reduce_only,
            close_position: reduce_only,
            price_protect: false,
            created_at: now,
            updated_at: now,
        })
        .await?;

    info!(
        trader = %trader.name,
        symbol = %d.symbol,
        action = d.action.as_str(),
        qty,
        order_id = %ack.exchange_order_id,
        "order submitted"
    );
    Ok(format!(
        "{}: {} {:.4} @ ~{:.2} (order {})",
        d.symbol,
        d.action.as_str(),
        qty,
        mark,
        ack.exchange_order_id
    ))
}

async fn snapshot_equity(deps: &CycleDeps, trader: &Trader) -> Result<()> {
    let account = deps.adapter.account_info().await?;
    deps.store
        .insert_equity_snapshot(&EquitySnapshot {
            trader_id: trader.id.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
            total_equity: round2(account.total_equity),
            balance: round2(account.available_balance),
            unrealized_pnl: round2(account.unrealized_pnl),
            position_count: account.position_count,
            margin_used_pct: round2(account.margin_used_pct),
        })
        .await
}
