//! Reconciliation: folding exchange fills into the local position ledger.
//!
//! Fills are the single source of position mutation. The ledger converges to
//! exchange truth under any interleaving as long as fills arrive in
//! non-decreasing time per `(symbol, side)`; duplicates are absorbed by the
//! fill table's unique key before they can touch a position.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::exchange::{ExchangeAdapter, FillEvent, OrderSide};
use crate::models::{round2, round4, PositionSide, PositionStatus, TradeAction};
use crate::store::{FillRecord, Position, Store};

/// Quantity tolerance when deciding partial vs full close.
const QTY_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct TradeUpdate {
    pub trader_id: String,
    pub exchange_id: String,
    pub venue: String,
    pub symbol: String,
    pub action: TradeAction,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    /// Venue-computed pnl; inferred from the entry price when absent.
    pub realized_pnl: Option<f64>,
    pub ts_ms: i64,
    pub order_id: String,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
}

impl Reconciler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Apply one trade to the ledger.
    pub async fn process_trade(&self, t: &TradeUpdate) -> Result<()> {
        if !(t.qty > 0.0) || !(t.price > 0.0) {
            return Err(anyhow!("trade must have positive qty and price"));
        }
        let side = t
            .action
            .side()
            .ok_or_else(|| anyhow!("{} is not a position-changing action", t.action.as_str()))?;

        match t.action {
            TradeAction::OpenLong | TradeAction::OpenShort => self.apply_open(t, side).await,
            TradeAction::CloseLong | TradeAction::CloseShort => self.apply_close(t, side).await,
            _ => unreachable!(),
        }
    }

    async fn apply_open(&self, t: &TradeUpdate, side: PositionSide) -> Result<()> {
        let existing = self
            .store
            .find_open_position(&t.trader_id, &t.symbol, side)
            .await?;

        match existing {
            None => {
                self.store
                    .insert_position(Position {
                        id: String::new(),
                        trader_id: t.trader_id.clone(),
                        exchange_id: t.exchange_id.clone(),
                        venue: t.venue.clone(),
                        exchange_position_id: String::new(),
                        symbol: t.symbol.clone(),
                        side,
                        entry_qty: round4(t.qty),
                        qty: round4(t.qty),
                        entry_price: round2(t.price),
                        entry_order_id: t.order_id.clone(),
                        entry_time: t.ts_ms,
                        exit_price: 0.0,
                        exit_order_id: String::new(),
                        exit_time: 0,
                        realized_pnl: 0.0,
                        fee: round2(t.fee),
                        leverage: 1,
                        status: PositionStatus::Open,
                        close_reason: String::new(),
                        source: "sync".to_string(),
                    })
                    .await?;
            }
            Some(mut pos) => {
                // Average in: both entry_qty and qty grow, entry price is the
                // volume-weighted mean of all contributing opens.
                let new_qty = pos.qty + t.qty;
                pos.entry_price =
                    round2((pos.entry_price * pos.qty + t.price * t.qty) / new_qty);
                pos.qty = round4(new_qty);
                pos.entry_qty = round4(pos.entry_qty + t.qty);
                pos.fee = round2(pos.fee + t.fee);
                self.store.update_position(&pos).await?;
            }
        }
        Ok(())
    }

    async fn apply_close(&self, t: &TradeUpdate, side: PositionSide) -> Result<()> {
        let Some(mut pos) = self
            .store
            .find_open_position(&t.trader_id, &t.symbol, side)
            .await?
        else {
            // Out-of-order event or pre-seed history; nothing to mutate.
            info!(
                symbol = %t.symbol,
                side = side.as_str(),
                "close with no open position, skipping"
            );
            return Ok(());
        };

        let mut close_qty = t.qty;
        if close_qty > pos.qty + QTY_EPSILON {
            warn!(
                symbol = %t.symbol,
                requested = close_qty,
                open = pos.qty,
                "over-close clamped to open quantity"
            );
            close_qty = pos.qty;
        }

        let pnl = t.realized_pnl.unwrap_or_else(|| match side {
            PositionSide::Long => (t.price - pos.entry_price) * close_qty,
            PositionSide::Short => (pos.entry_price - t.price) * close_qty,
        });

        // Weighted average exit over everything closed so far.
        let closed_before = (pos.entry_qty - pos.qty).max(0.0);
        let closed_total = closed_before + close_qty;
        pos.exit_price = if closed_total > 0.0 {
            round2((pos.exit_price * closed_before + t.price * close_qty) / closed_total)
        } else {
            round2(t.price)
        };
        pos.realized_pnl = round2(pos.realized_pnl + pnl);
        pos.fee = round2(pos.fee + t.fee);
        pos.exit_order_id = t.order_id.clone();

        if t.qty >= pos.qty - QTY_EPSILON {
            pos.qty = 0.0;
            pos.status = PositionStatus::Closed;
            pos.exit_time = t.ts_ms;
        } else {
            pos.qty = round4(pos.qty - close_qty);
        }

        self.store.update_position(&pos).await?;
        Ok(())
    }

    /// Persist one exchange fill and apply it to the ledger. Returns false
    /// when the `(exchange, trade_id)` pair was already ingested; duplicates
    /// never touch positions.
    pub async fn ingest_fill(
        &self,
        trader_id: &str,
        exchange_id: &str,
        venue: &str,
        fill: &FillEvent,
    ) -> Result<bool> {
        let inserted = self
            .store
            .insert_fill(FillRecord {
                id: String::new(),
                trader_id: trader_id.to_string(),
                exchange_id: exchange_id.to_string(),
                venue: venue.to_string(),
                order_id: None,
                exchange_order_id: fill.exchange_order_id.clone(),
                exchange_trade_id: fill.exchange_trade_id.clone(),
                symbol: fill.symbol.clone(),
                side: fill.side.as_str().to_string(),
                price: round2(fill.price),
                qty: round4(fill.qty),
                quote_qty: round2(fill.quote_qty),
                commission: fill.commission,
                realized_pnl: round2(fill.realized_pnl.unwrap_or(0.0)),
                is_maker: fill.is_maker,
                created_at: fill.ts_ms,
            })
            .await?;
        if !inserted {
            return Ok(false);
        }

        let action = action_for(fill.side, fill.position_side);
        self.process_trade(&TradeUpdate {
            trader_id: trader_id.to_string(),
            exchange_id: exchange_id.to_string(),
            venue: venue.to_string(),
            symbol: fill.symbol.clone(),
            action,
            qty: fill.qty,
            price: fill.price,
            fee: fill.commission,
            realized_pnl: fill.realized_pnl,
            ts_ms: fill.ts_ms,
            order_id: fill.exchange_order_id.clone(),
        })
        .await?;
        Ok(true)
    }

    /// Catch-up pass: pull fills newer than the stored watermark and ingest
    /// them in order. Used on restart and by the periodic sync loop.
    pub async fn sync_fills(
        &self,
        trader_id: &str,
        exchange_id: &str,
        adapter: &Arc<dyn ExchangeAdapter>,
    ) -> Result<usize> {
        let watermark = self.store.latest_fill_ts(exchange_id).await?;
        let fills = adapter.fills_since(watermark).await?;
        let venue = adapter.venue().as_str();

        let mut ingested = 0usize;
        for fill in &fills {
            if self.ingest_fill(trader_id, exchange_id, venue, fill).await? {
                ingested += 1;
            }
        }
        if ingested > 0 {
            info!(trader_id, exchange_id, ingested, "fill sync caught up");
        }
        Ok(ingested)
    }

    /// Import CLOSED positions straight from an exchange's closed-PnL
    /// history, deduplicated on `(exchange, exchange_position_id)`.
    pub async fn import_closed_pnl(
        &self,
        trader_id: &str,
        exchange_id: &str,
        adapter: &Arc<dyn ExchangeAdapter>,
        since_ms: i64,
    ) -> Result<usize> {
        let records = adapter.closed_pnl_since(since_ms).await?;
        let venue = adapter.venue().as_str();

        let mut imported = 0usize;
        for rec in &records {
            let inserted = self
                .store
                .insert_position_if_absent(Position {
                    id: String::new(),
                    trader_id: trader_id.to_string(),
                    exchange_id: exchange_id.to_string(),
                    venue: venue.to_string(),
                    exchange_position_id: rec.exchange_position_id.clone(),
                    symbol: rec.symbol.clone(),
                    side: rec.side,
                    entry_qty: round4(rec.qty),
                    qty: 0.0,
                    entry_price: round2(rec.entry_price),
                    entry_order_id: String::new(),
                    entry_time: rec.opened_at_ms,
                    exit_price: round2(rec.exit_price),
                    exit_order_id: String::new(),
                    exit_time: rec.closed_at_ms,
                    realized_pnl: round2(rec.realized_pnl),
                    fee: round2(rec.fee),
                    leverage: 1,
                    status: PositionStatus::Closed,
                    close_reason: "imported".to_string(),
                    source: "sync".to_string(),
                })
                .await?;
            if inserted {
                imported += 1;
            }
        }
        Ok(imported)
    }
}

fn action_for(side: OrderSide, position_side: PositionSide) -> TradeAction {
    match (side, position_side) {
        (OrderSide::Buy, PositionSide::Long) => TradeAction::OpenLong,
        (OrderSide::Sell, PositionSide::Long) => TradeAction::CloseLong,
        (OrderSide::Sell, PositionSide::Short) => TradeAction::OpenShort,
        (OrderSide::Buy, PositionSide::Short) => TradeAction::CloseShort,
    }
}
