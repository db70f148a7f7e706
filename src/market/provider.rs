//! Market-data access behind one trait so engines never care which vendor is
//! wired in. The HTTP provider speaks the common futures REST shapes; the
//! static provider backs tests.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use super::{Kline, QuantData, RankingEntry};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>>;
    async fn last_price(&self, symbol: &str) -> Result<f64>;
    async fn funding_rate(&self, symbol: &str) -> Result<f64>;
    async fn open_interest(&self, symbol: &str) -> Result<f64>;
    async fn quant(&self, symbol: &str) -> Result<QuantData>;
    /// Leaderboard by 24h (or configured-window) open-interest change.
    async fn oi_ranking(&self, duration: &str, top_n: usize) -> Result<Vec<RankingEntry>>;
    async fn net_flow_ranking(&self, duration: &str, top_n: usize) -> Result<Vec<RankingEntry>>;
    async fn price_change_ranking(&self, duration: &str, top_n: usize)
        -> Result<Vec<RankingEntry>>;
    /// Curated candidate list ("ai500"-style source).
    async fn curated_top(&self, top_n: usize) -> Result<Vec<String>>;
}

/// REST provider. Klines and per-symbol stats come from a futures API
/// (binance-compatible paths); leaderboards come from an optional ranking
/// service configured separately.
pub struct HttpMarketProvider {
    http: reqwest::Client,
    base_url: String,
    ranking_base_url: Option<String>,
    api_key: Option<String>,
}

impl HttpMarketProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        ranking_base_url: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ranking_base_url: ranking_base_url.map(|s| s.trim_end_matches('/').to_string()),
            api_key,
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let mut req = self.http.get(url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key);
        }
        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("market api {}: {}", status.as_u16(), snippet));
        }
        serde_json::from_str(&body).with_context(|| format!("parse market json from {url}"))
    }

    fn ranking_url(&self, kind: &str, duration: &str, top_n: usize) -> Result<String> {
        let Some(base) = &self.ranking_base_url else {
            return Err(anyhow!("ranking provider not configured"));
        };
        Ok(format!(
            "{base}/rankings/{kind}?duration={duration}&top_n={top_n}"
        ))
    }

    async fn fetch_ranking(
        &self,
        kind: &str,
        duration: &str,
        top_n: usize,
    ) -> Result<Vec<RankingEntry>> {
        let url = self.ranking_url(kind, duration, top_n)?;
        let value = self.get_json(&url).await?;
        let rows = value
            .as_array()
            .ok_or_else(|| anyhow!("ranking response is not an array"))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(base_coin) = row.get("base_coin").and_then(|v| v.as_str()) else {
                continue;
            };
            out.push(RankingEntry {
                base_coin: base_coin.to_string(),
                price: row.get("price").and_then(|v| v.as_f64()).unwrap_or(0.0),
                change: row.get("change").and_then(|v| v.as_f64()).unwrap_or(0.0),
            });
        }
        out.truncate(top_n);
        Ok(out)
    }
}

fn num(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketProvider {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        if !super::is_valid_interval(interval) {
            return Err(anyhow!("unsupported kline interval {interval}"));
        }
        let url = format!(
            "{}/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}",
            self.base_url
        );
        let value = self.get_json(&url).await?;
        let rows = value
            .as_array()
            .ok_or_else(|| anyhow!("kline response is not an array"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(cells) = row.as_array() else {
                continue;
            };
            if cells.len() < 9 {
                continue;
            }
            out.push(Kline {
                open_time: cells[0].as_i64().unwrap_or(0),
                open: num(&cells[1]),
                high: num(&cells[2]),
                low: num(&cells[3]),
                close: num(&cells[4]),
                volume: num(&cells[5]),
                close_time: cells[6].as_i64().unwrap_or(0),
                quote_volume: num(&cells[7]),
                trade_count: cells[8].as_u64().unwrap_or(0),
            });
        }
        debug!(symbol, interval, rows = out.len(), "fetched klines");
        Ok(out)
    }

    async fn last_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={symbol}", self.base_url);
        let value = self.get_json(&url).await?;
        let price = value
            .get("price")
            .map(num)
            .filter(|p| *p > 0.0)
            .ok_or_else(|| anyhow!("no price for {symbol}"))?;
        Ok(price)
    }

    async fn funding_rate(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={symbol}", self.base_url);
        let value = self.get_json(&url).await?;
        Ok(value.get("lastFundingRate").map(num).unwrap_or(0.0))
    }

    async fn open_interest(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/openInterest?symbol={symbol}", self.base_url);
        let value = self.get_json(&url).await?;
        Ok(value.get("openInterest").map(num).unwrap_or(0.0))
    }

    async fn quant(&self, symbol: &str) -> Result<QuantData> {
        let Some(base) = &self.ranking_base_url else {
            return Err(anyhow!("ranking provider not configured"));
        };
        let url = format!("{base}/quant/{symbol}");
        let value = self.get_json(&url).await?;
        Ok(QuantData {
            oi_delta_pct: value.get("oi_delta_pct").map(num).unwrap_or(0.0),
            net_flow_usd: value.get("net_flow_usd").map(num).unwrap_or(0.0),
            price_change_pct: value.get("price_change_pct").map(num).unwrap_or(0.0),
        })
    }

    async fn oi_ranking(&self, duration: &str, top_n: usize) -> Result<Vec<RankingEntry>> {
        self.fetch_ranking("oi-change", duration, top_n).await
    }

    async fn net_flow_ranking(&self, duration: &str, top_n: usize) -> Result<Vec<RankingEntry>> {
        self.fetch_ranking("net-flow", duration, top_n).await
    }

    async fn price_change_ranking(
        &self,
        duration: &str,
        top_n: usize,
    ) -> Result<Vec<RankingEntry>> {
        self.fetch_ranking("price-change", duration, top_n).await
    }

    async fn curated_top(&self, top_n: usize) -> Result<Vec<String>> {
        let Some(base) = &self.ranking_base_url else {
            return Err(anyhow!("ranking provider not configured"));
        };
        let url = format!("{base}/curated?top_n={top_n}");
        let value = self.get_json(&url).await?;
        let coins = value
            .as_array()
            .ok_or_else(|| anyhow!("curated response is not an array"))?
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .take(top_n)
            .collect();
        Ok(coins)
    }
}

/// Deterministic in-memory provider for tests and dry runs.
#[derive(Default)]
pub struct StaticMarketProvider {
    inner: RwLock<StaticInner>,
}

#[derive(Default)]
struct StaticInner {
    klines: HashMap<(String, String), Vec<Kline>>,
    prices: HashMap<String, f64>,
    quant: HashMap<String, QuantData>,
    oi_ranking: Vec<RankingEntry>,
    net_flow_ranking: Vec<RankingEntry>,
    price_change_ranking: Vec<RankingEntry>,
    curated: Vec<String>,
}

impl StaticMarketProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.inner.write().prices.insert(symbol.to_string(), price);
    }

    pub fn set_klines(&self, symbol: &str, interval: &str, klines: Vec<Kline>) {
        self.inner
            .write()
            .klines
            .insert((symbol.to_string(), interval.to_string()), klines);
    }

    pub fn set_quant(&self, symbol: &str, quant: QuantData) {
        self.inner.write().quant.insert(symbol.to_string(), quant);
    }

    pub fn set_oi_ranking(&self, entries: Vec<RankingEntry>) {
        self.inner.write().oi_ranking = entries;
    }

    pub fn set_curated(&self, coins: Vec<String>) {
        self.inner.write().curated = coins;
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketProvider {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let inner = self.inner.read();
        let mut klines = inner
            .klines
            .get(&(symbol.to_string(), interval.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no klines for {symbol} {interval}"))?;
        if klines.len() > limit {
            klines = klines.split_off(klines.len() - limit);
        }
        Ok(klines)
    }

    async fn last_price(&self, symbol: &str) -> Result<f64> {
        self.inner
            .read()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {symbol}"))
    }

    async fn funding_rate(&self, _symbol: &str) -> Result<f64> {
        Ok(0.0001)
    }

    async fn open_interest(&self, _symbol: &str) -> Result<f64> {
        Ok(0.0)
    }

    async fn quant(&self, symbol: &str) -> Result<QuantData> {
        Ok(self
            .inner
            .read()
            .quant
            .get(symbol)
            .copied()
            .unwrap_or_default())
    }

    async fn oi_ranking(&self, _duration: &str, top_n: usize) -> Result<Vec<RankingEntry>> {
        let mut out = self.inner.read().oi_ranking.clone();
        out.truncate(top_n);
        Ok(out)
    }

    async fn net_flow_ranking(&self, _duration: &str, top_n: usize) -> Result<Vec<RankingEntry>> {
        let mut out = self.inner.read().net_flow_ranking.clone();
        out.truncate(top_n);
        Ok(out)
    }

    async fn price_change_ranking(
        &self,
        _duration: &str,
        top_n: usize,
    ) -> Result<Vec<RankingEntry>> {
        let mut out = self.inner.read().price_change_ranking.clone();
        out.truncate(top_n);
        Ok(out)
    }

    async fn curated_top(&self, top_n: usize) -> Result<Vec<String>> {
        let mut out = self.inner.read().curated.clone();
        out.truncate(top_n);
        Ok(out)
    }
}
