//! Uniform exchange-adapter contract. Venue-specific REST/WS clients live
//! outside this crate; the core only consumes this trait. The paper adapter
//! here backs tests and paper-trading mode.

pub mod paper;

pub use paper::PaperExchange;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{AccountSnapshot, PositionSide, Venue};
use crate::store::ExchangeAccount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    /// "MARKET" or "LIMIT".
    pub order_type: String,
    pub tif: String,
    pub qty: f64,
    /// Limit price; ignored for market orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub leverage: u32,
    pub reduce_only: bool,
    /// Absolute trigger prices, already converted from fractional distances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: String,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub commission: f64,
}

/// One venue-reported execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub exchange_order_id: String,
    pub exchange_trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub price: f64,
    pub qty: f64,
    pub quote_qty: f64,
    pub commission: f64,
    /// Venue-computed realized pnl where available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    pub is_maker: bool,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub exchange_position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPnlRecord {
    pub exchange_position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub opened_at_ms: i64,
    pub closed_at_ms: i64,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    async fn account_info(&self) -> Result<AccountSnapshot>;

    async fn positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck>;

    async fn mark_price(&self, symbol: &str) -> Result<f64>;

    /// Fills newer than `since_ms`, ascending by time. Adapters MUST page in
    /// that order so reconciliation sees a monotone stream.
    async fn fills_since(&self, since_ms: i64) -> Result<Vec<FillEvent>>;

    async fn closed_pnl_since(&self, since_ms: i64) -> Result<Vec<ClosedPnlRecord>>;
}

/// Resolve the adapter for an exchange account. With paper trading on, every
/// venue maps to an isolated in-memory paper exchange; otherwise this is the
/// seam where live venue clients get wired in.
pub fn adapter_for(
    account: &ExchangeAccount,
    paper_trading: bool,
    initial_balance: f64,
) -> Result<Arc<dyn ExchangeAdapter>> {
    let venue = account
        .venue()
        .ok_or_else(|| anyhow!("unknown venue {:?}", account.exchange_type))?;
    if paper_trading || account.testnet {
        return Ok(Arc::new(PaperExchange::new(venue, initial_balance)));
    }
    Err(anyhow!(
        "no live adapter wired for venue {}; enable paper trading",
        venue.as_str()
    ))
}
