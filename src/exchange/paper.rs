//! In-memory paper exchange. Orders fill instantly at the mark price with a
//! flat taker fee; fills are queued for the reconciliation loop exactly like
//! a live venue would report them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    ClosedPnlRecord, ExchangeAdapter, ExchangePosition, FillEvent, OrderAck, OrderRequest,
    OrderSide,
};
use crate::models::{round2, AccountSnapshot, PositionSide, Venue};

const TAKER_FEE_RATE: f64 = 0.0005;

#[derive(Debug, Clone)]
struct PaperPosition {
    position_id: String,
    qty: f64,
    entry_price: f64,
    leverage: u32,
}

#[derive(Default)]
struct PaperState {
    balance: f64,
    marks: HashMap<String, f64>,
    positions: HashMap<(String, PositionSide), PaperPosition>,
    fills: Vec<FillEvent>,
    closed: Vec<ClosedPnlRecord>,
    order_seq: u64,
    trade_seq: u64,
    clock_ms: i64,
}

pub struct PaperExchange {
    venue: Venue,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(venue: Venue, initial_balance: f64) -> Self {
        Self {
            venue,
            state: Mutex::new(PaperState {
                balance: initial_balance,
                clock_ms: 1,
                ..Default::default()
            }),
        }
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// Advance the synthetic clock; fills stamped after this call carry the
    /// new time.
    pub fn advance_clock(&self, ms: i64) {
        self.state.lock().clock_ms += ms.max(0);
    }

    fn unrealized(&self, state: &PaperState) -> f64 {
        state
            .positions
            .iter()
            .map(|((symbol, side), pos)| {
                let mark = state.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                match side {
                    PositionSide::Long => (mark - pos.entry_price) * pos.qty,
                    PositionSide::Short => (pos.entry_price - mark) * pos.qty,
                }
            })
            .sum()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn account_info(&self) -> Result<AccountSnapshot> {
        let state = self.state.lock();
        let unrealized = self.unrealized(&state);
        let total_equity = state.balance + unrealized;
        let margin_used: f64 = state
            .positions
            .iter()
            .map(|((symbol, _), pos)| {
                let mark = state.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                mark * pos.qty / pos.leverage.max(1) as f64
            })
            .sum();
        Ok(AccountSnapshot {
            total_equity,
            available_balance: (state.balance - margin_used).max(0.0),
            unrealized_pnl: unrealized,
            margin_used_pct: if total_equity > 0.0 {
                (margin_used / total_equity * 100.0).min(100.0)
            } else {
                0.0
            },
            position_count: state.positions.len(),
        })
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        let state = self.state.lock();
        Ok(state
            .positions
            .iter()
            .map(|((symbol, side), pos)| {
                let mark = state.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                let unrealized = match side {
                    PositionSide::Long => (mark - pos.entry_price) * pos.qty,
                    PositionSide::Short => (pos.entry_price - mark) * pos.qty,
                };
                ExchangePosition {
                    exchange_position_id: pos.position_id.clone(),
                    symbol: symbol.clone(),
                    side: *side,
                    qty: pos.qty,
                    entry_price: pos.entry_price,
                    mark_price: mark,
                    unrealized_pnl: unrealized,
                    leverage: pos.leverage,
                }
            })
            .collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock();
        let mark = state
            .marks
            .get(&req.symbol)
            .copied()
            .ok_or_else(|| anyhow!("no mark price for {}", req.symbol))?;
        if !(req.qty > 0.0) {
            return Err(anyhow!("order qty must be positive"));
        }

        let price = match req.order_type.as_str() {
            "LIMIT" => req.price.unwrap_or(mark),
            _ => mark,
        };
        let notional = price * req.qty;
        let commission = notional * TAKER_FEE_RATE;

        state.order_seq += 1;
        state.trade_seq += 1;
        let order_id = format!("paper-o-{}", state.order_seq);
        let trade_id = format!("paper-t-{}", state.trade_seq);
        let ts_ms = state.clock_ms;

        let opening = matches!(
            (req.side, req.position_side),
            (OrderSide::Buy, PositionSide::Long) | (OrderSide::Sell, PositionSide::Short)
        );

        let key = (req.symbol.clone(), req.position_side);
        let mut realized_pnl: Option<f64> = None;
        let mut fill_qty = req.qty;

        if opening {
            state.balance -= commission;
            let seq = state.order_seq;
            let entry = state.positions.entry(key).or_insert_with(|| PaperPosition {
                position_id: format!("paper-p-{seq}"),
                qty: 0.0,
                entry_price: price,
                leverage: req.leverage.max(1),
            });
            let new_qty = entry.qty + req.qty;
            entry.entry_price = (entry.entry_price * entry.qty + price * req.qty) / new_qty;
            entry.qty = new_qty;
            entry.leverage = req.leverage.max(1);
        } else {
            let Some(pos) = state.positions.get_mut(&key) else {
                return Err(anyhow!("no open {} position for {}", req.position_side.as_str(), req.symbol));
            };
            fill_qty = req.qty.min(pos.qty);
            let pnl = match req.position_side {
                PositionSide::Long => (price - pos.entry_price) * fill_qty,
                PositionSide::Short => (pos.entry_price - price) * fill_qty,
            };
            realized_pnl = Some(pnl);
            pos.qty -= fill_qty;
            let fully_closed = pos.qty <= 1e-9;
            let entry_price = pos.entry_price;
            let position_id = pos.position_id.clone();
            if fully_closed {
                state.positions.remove(&key);
                state.closed.push(ClosedPnlRecord {
                    exchange_position_id: position_id,
                    symbol: req.symbol.clone(),
                    side: req.position_side,
                    qty: fill_qty,
                    entry_price,
                    exit_price: price,
                    realized_pnl: round2(pnl),
                    fee: round2(commission),
                    opened_at_ms: ts_ms,
                    closed_at_ms: ts_ms,
                });
            }
            state.balance += pnl - commission;
        }

        state.fills.push(FillEvent {
            exchange_order_id: order_id.clone(),
            exchange_trade_id: trade_id,
            symbol: req.symbol.clone(),
            side: req.side,
            position_side: req.position_side,
            price,
            qty: fill_qty,
            quote_qty: price * fill_qty,
            commission,
            realized_pnl,
            is_maker: false,
            ts_ms,
        });

        Ok(OrderAck {
            exchange_order_id: order_id,
            status: "FILLED".to_string(),
            filled_qty: fill_qty,
            avg_price: price,
            commission,
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        self.state
            .lock()
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no mark price for {symbol}"))
    }

    async fn fills_since(&self, since_ms: i64) -> Result<Vec<FillEvent>> {
        let state = self.state.lock();
        let mut out: Vec<FillEvent> = state
            .fills
            .iter()
            .filter(|f| f.ts_ms > since_ms)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.ts_ms);
        Ok(out)
    }

    async fn closed_pnl_since(&self, since_ms: i64) -> Result<Vec<ClosedPnlRecord>> {
        let state = self.state.lock();
        let mut out: Vec<ClosedPnlRecord> = state
            .closed
            .iter()
            .filter(|c| c.closed_at_ms > since_ms)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.closed_at_ms);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_order(
        symbol: &str,
        side: OrderSide,
        position_side: PositionSide,
        qty: f64,
    ) -> OrderRequest {
        OrderRequest {
            client_order_id: String::new(),
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: "MARKET".to_string(),
            tif: "GTC".to_string(),
            qty,
            price: None,
            leverage: 5,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn open_then_close_realizes_pnl() {
        let ex = PaperExchange::new(Venue::Binance, 1000.0);
        ex.set_mark_price("BTCUSDT", 100.0);

        ex.place_order(&market_order(
            "BTCUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            1.0,
        ))
        .await
        .unwrap();

        ex.advance_clock(1000);
        ex.set_mark_price("BTCUSDT", 110.0);

        let ack = ex
            .place_order(&market_order(
                "BTCUSDT",
                OrderSide::Sell,
                PositionSide::Long,
                1.0,
            ))
            .await
            .unwrap();
        assert_eq!(ack.filled_qty, 1.0);

        let fills = ex.fills_since(0).await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].realized_pnl, Some(10.0));

        let closed = ex.closed_pnl_since(0).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].realized_pnl, 10.0);

        let info = ex.account_info().await.unwrap();
        assert_eq!(info.position_count, 0);
        assert!(info.total_equity > 1000.0 && info.total_equity < 1010.0);
    }

    #[tokio::test]
    async fn close_without_position_rejected() {
        let ex = PaperExchange::new(Venue::Bybit, 100.0);
        ex.set_mark_price("ETHUSDT", 2000.0);
        let err = ex
            .place_order(&market_order(
                "ETHUSDT",
                OrderSide::Buy,
                PositionSide::Short,
                1.0,
            ))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn fills_are_time_filtered_and_ordered() {
        let ex = PaperExchange::new(Venue::Okx, 1000.0);
        ex.set_mark_price("SOLUSDT", 150.0);

        ex.place_order(&market_order(
            "SOLUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            1.0,
        ))
        .await
        .unwrap();
        ex.advance_clock(500);
        ex.place_order(&market_order(
            "SOLUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            1.0,
        ))
        .await
        .unwrap();

        let all = ex.fills_since(0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].ts_ms < all[1].ts_ms);

        let later = ex.fills_since(all[0].ts_ms).await.unwrap();
        assert_eq!(later.len(), 1);
    }
}
