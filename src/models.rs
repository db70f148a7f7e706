//! Shared domain types used across the store, decision pipeline, and engines.

use serde::{Deserialize, Serialize};

/// Supported perpetual-futures venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
    Bitget,
    Hyperliquid,
    Aster,
    Lighter,
    Gateio,
}

impl Venue {
    pub const ALL: [Venue; 8] = [
        Venue::Binance,
        Venue::Bybit,
        Venue::Okx,
        Venue::Bitget,
        Venue::Hyperliquid,
        Venue::Aster,
        Venue::Lighter,
        Venue::Gateio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
            Venue::Bitget => "bitget",
            Venue::Hyperliquid => "hyperliquid",
            Venue::Aster => "aster",
            Venue::Lighter => "lighter",
            Venue::Gateio => "gateio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Some(Venue::Binance),
            "bybit" => Some(Venue::Bybit),
            "okx" => Some(Venue::Okx),
            "bitget" => Some(Venue::Bitget),
            "hyperliquid" => Some(Venue::Hyperliquid),
            "aster" => Some(Venue::Aster),
            "lighter" => Some(Venue::Lighter),
            "gateio" => Some(Venue::Gateio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(PositionStatus::Open),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// The action space a model may choose from, one entry per candidate coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl TradeAction {
    pub const ALL: [TradeAction; 6] = [
        TradeAction::OpenLong,
        TradeAction::OpenShort,
        TradeAction::CloseLong,
        TradeAction::CloseShort,
        TradeAction::Hold,
        TradeAction::Wait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::OpenLong => "open_long",
            TradeAction::OpenShort => "open_short",
            TradeAction::CloseLong => "close_long",
            TradeAction::CloseShort => "close_short",
            TradeAction::Hold => "hold",
            TradeAction::Wait => "wait",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TradeAction::OpenLong | TradeAction::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, TradeAction::CloseLong | TradeAction::CloseShort)
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, TradeAction::Hold | TradeAction::Wait)
    }

    pub fn side(&self) -> Option<PositionSide> {
        match self {
            TradeAction::OpenLong | TradeAction::CloseLong => Some(PositionSide::Long),
            TradeAction::OpenShort | TradeAction::CloseShort => Some(PositionSide::Short),
            TradeAction::Hold | TradeAction::Wait => None,
        }
    }

    /// Deterministic priority used to break consensus score ties.
    pub fn priority(&self) -> u8 {
        match self {
            TradeAction::Wait => 0,
            TradeAction::Hold => 1,
            TradeAction::OpenLong => 2,
            TradeAction::OpenShort => 3,
            TradeAction::CloseLong => 4,
            TradeAction::CloseShort => 5,
        }
    }
}

/// Tone / risk-appetite tag appended to the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVariant {
    Balanced,
    Aggressive,
    Conservative,
    Scalping,
}

impl Default for PromptVariant {
    fn default() -> Self {
        PromptVariant::Balanced
    }
}

impl PromptVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptVariant::Balanced => "balanced",
            PromptVariant::Aggressive => "aggressive",
            PromptVariant::Conservative => "conservative",
            PromptVariant::Scalping => "scalping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Some(PromptVariant::Balanced),
            "aggressive" => Some(PromptVariant::Aggressive),
            "conservative" => Some(PromptVariant::Conservative),
            "scalping" => Some(PromptVariant::Scalping),
            _ => None,
        }
    }
}

/// One structured per-coin decision as parsed from a model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub symbol: String,
    pub action: TradeAction,
    /// 0..=100.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    /// Fraction of available balance, (0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_pct: Option<f64>,
    /// Fractional distance from entry, e.g. 0.03 = 3%.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Point-in-time account summary from an exchange adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// Prices and pnl are persisted at 2 decimals.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Quantities are persisted at 4 decimals.
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Normalize user-facing coin input ("btc", "BTCUSDT") to `BTCUSDT` form.
pub fn normalize_symbol(raw: &str) -> String {
    let s = raw.trim().to_ascii_uppercase();
    if s.is_empty() {
        return s;
    }
    if s.ends_with("USDT") {
        s
    } else {
        format!("{s}USDT")
    }
}

pub fn is_btc_eth(symbol: &str) -> bool {
    let s = symbol.trim().to_ascii_uppercase();
    s.starts_with("BTC") || s.starts_with("ETH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_roundtrip() {
        for v in Venue::ALL {
            assert_eq!(Venue::parse(v.as_str()), Some(v));
        }
        assert_eq!(Venue::parse("BINANCE"), Some(Venue::Binance));
        assert_eq!(Venue::parse("ftx"), None);
    }

    #[test]
    fn symbol_normalization() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol(" SOLUSDT "), "SOLUSDT");
        assert_eq!(normalize_symbol(""), "");
    }

    #[test]
    fn rounding() {
        assert_eq!(round2(110.004999), 110.0);
        assert_eq!(round2(109.995001), 110.0);
        assert_eq!(round4(0.60004), 0.6);
    }

    #[test]
    fn action_tie_break_order() {
        let mut actions = TradeAction::ALL.to_vec();
        actions.sort_by_key(|a| a.priority());
        assert_eq!(actions[0], TradeAction::Wait);
        assert_eq!(actions[5], TradeAction::CloseShort);
    }
}
