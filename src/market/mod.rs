//! Market-data types and the per-cycle context assembler.

pub mod context;
pub mod indicators;
pub mod provider;

pub use context::{ContextBuilder, TradeContext};
pub use provider::{HttpMarketProvider, MarketDataProvider, StaticMarketProvider};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d",
];

pub fn is_valid_interval(s: &str) -> bool {
    INTERVALS.contains(&s)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
}

/// Indicator series computed from one interval's klines. Which fields are
/// populated follows the strategy's indicator switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSeries {
    /// period -> series, aligned to the kline tail.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ema: HashMap<usize, Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd: Option<indicators::MacdSeries>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rsi: HashMap<usize, Vec<f64>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub atr: HashMap<usize, Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boll: Option<indicators::BollSeries>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_sma: Vec<f64>,
}

/// Multi-timeframe view of one symbol for one cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub last_price: f64,
    /// interval -> klines (ascending time).
    pub klines: HashMap<String, Vec<Kline>>,
    /// interval -> indicator series.
    pub indicators: HashMap<String, IndicatorSeries>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
}

/// Flow/positioning deltas for one symbol.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuantData {
    pub oi_delta_pct: f64,
    pub net_flow_usd: f64,
    pub price_change_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingEntry {
    pub base_coin: String,
    pub price: f64,
    /// Change of the ranked metric over the configured window.
    pub change: f64,
}

/// The three market-wide leaderboards offered to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingSnapshots {
    pub oi_change: Vec<RankingEntry>,
    pub net_flow: Vec<RankingEntry>,
    pub price_change: Vec<RankingEntry>,
}
