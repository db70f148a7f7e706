//! Per-cycle context assembly: candidate selection plus best-effort
//! concurrent market-data collection.

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::{
    indicators, IndicatorSeries, MarketData, MarketDataProvider, QuantData, RankingSnapshots,
};
use crate::models::{normalize_symbol, AccountSnapshot, PromptVariant};
use crate::store::{CoinSourceMode, IndicatorConfig, Position, StrategyConfig};

const KLINE_LIMIT: usize = 100;

/// Everything one decision cycle (or one debate) sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeContext {
    pub now_utc: String,
    pub uptime_secs: u64,
    pub cycle_number: u64,
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub candidates: Vec<String>,
    pub variant: PromptVariant,
    pub market: HashMap<String, MarketData>,
    pub quant: HashMap<String, QuantData>,
    pub rankings: RankingSnapshots,
}

pub struct ContextBuilder {
    provider: Arc<dyn MarketDataProvider>,
    max_candidates: usize,
}

impl ContextBuilder {
    pub fn new(provider: Arc<dyn MarketDataProvider>, max_candidates: usize) -> Self {
        Self {
            provider,
            max_candidates: max_candidates.max(1),
        }
    }

    pub async fn build(
        &self,
        cfg: &StrategyConfig,
        account: AccountSnapshot,
        positions: Vec<Position>,
        cycle_number: u64,
        uptime_secs: u64,
    ) -> Result<TradeContext> {
        let candidates = self.select_candidates(cfg).await?;

        // Held symbols always get market data so close decisions stay
        // informed, even when the candidate source rotated away from them.
        let mut fetch_list = candidates.clone();
        for pos in &positions {
            if !fetch_list.contains(&pos.symbol) {
                fetch_list.push(pos.symbol.clone());
            }
        }

        let market = self.fetch_market(&fetch_list, &cfg.indicators).await;
        let quant = self.fetch_quant(&fetch_list).await;
        let rankings = self.fetch_rankings(cfg).await;

        Ok(TradeContext {
            now_utc: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            uptime_secs,
            cycle_number,
            account,
            positions,
            candidates,
            variant: cfg.variant,
            market,
            quant,
            rankings,
        })
    }

    async fn select_candidates(&self, cfg: &StrategyConfig) -> Result<Vec<String>> {
        let src = &cfg.coin_source;
        let exclusions: Vec<String> = src.exclusions.iter().map(|s| normalize_symbol(s)).collect();

        let mut coins: Vec<String> = match src.mode {
            CoinSourceMode::Static => src.static_coins.iter().map(|s| normalize_symbol(s)).collect(),
            CoinSourceMode::OiTop => self.oi_top(cfg, src.top_n).await?,
            CoinSourceMode::Ai500 => self
                .provider
                .curated_top(src.top_n)
                .await?
                .iter()
                .map(|s| normalize_symbol(s))
                .collect(),
            CoinSourceMode::Mixed => {
                let mut merged: Vec<String> =
                    src.static_coins.iter().map(|s| normalize_symbol(s)).collect();
                match self.oi_top(cfg, src.top_n).await {
                    Ok(ranked) => merged.extend(ranked),
                    Err(e) => warn!(error = %e, "oi ranking unavailable for mixed source"),
                }
                match self.provider.curated_top(src.top_n).await {
                    Ok(curated) => {
                        merged.extend(curated.iter().map(|s| normalize_symbol(s)));
                    }
                    Err(e) => warn!(error = %e, "curated list unavailable for mixed source"),
                }
                merged
            }
        };

        coins.retain(|c| !c.is_empty() && !exclusions.contains(c));
        let mut seen = std::collections::HashSet::new();
        coins.retain(|c| seen.insert(c.clone()));
        coins.truncate(self.max_candidates);
        Ok(coins)
    }

    async fn oi_top(&self, cfg: &StrategyConfig, top_n: usize) -> Result<Vec<String>> {
        let duration = cfg
            .rankings
            .oi_change
            .as_ref()
            .map(|w| w.duration.clone())
            .unwrap_or_else(|| "24h".to_string());
        let ranked = self.provider.oi_ranking(&duration, top_n).await?;
        Ok(ranked
            .iter()
            .map(|e| normalize_symbol(&e.base_coin))
            .collect())
    }

    /// Fetch every symbol concurrently; a failed symbol is omitted, never
    /// fatal to the cycle.
    async fn fetch_market(
        &self,
        symbols: &[String],
        indicators_cfg: &IndicatorConfig,
    ) -> HashMap<String, MarketData> {
        let tasks = symbols.iter().map(|symbol| {
            let symbol = symbol.clone();
            async move {
                let data = self.fetch_symbol(&symbol, indicators_cfg).await;
                (symbol, data)
            }
        });

        let mut out = HashMap::new();
        for (symbol, result) in join_all(tasks).await {
            match result {
                Ok(data) => {
                    out.insert(symbol, data);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "market data omitted"),
            }
        }
        out
    }

    async fn fetch_symbol(
        &self,
        symbol: &str,
        cfg: &IndicatorConfig,
    ) -> Result<MarketData> {
        let mut data = MarketData {
            symbol: symbol.to_string(),
            last_price: self.provider.last_price(symbol).await?,
            ..Default::default()
        };

        for interval in &cfg.timeframes {
            let klines = self.provider.klines(symbol, interval, KLINE_LIMIT).await?;
            if klines.is_empty() {
                continue;
            }
            data.indicators
                .insert(interval.clone(), compute_indicators(&klines, cfg));
            data.klines.insert(interval.clone(), klines);
        }

        if cfg.funding_rate {
            match self.provider.funding_rate(symbol).await {
                Ok(rate) => data.funding_rate = Some(rate),
                Err(e) => warn!(symbol, error = %e, "funding rate omitted"),
            }
        }
        if cfg.open_interest {
            match self.provider.open_interest(symbol).await {
                Ok(oi) => data.open_interest = Some(oi),
                Err(e) => warn!(symbol, error = %e, "open interest omitted"),
            }
        }

        Ok(data)
    }

    async fn fetch_quant(&self, symbols: &[String]) -> HashMap<String, QuantData> {
        let tasks = symbols.iter().map(|symbol| {
            let symbol = symbol.clone();
            async move {
                let quant = self.provider.quant(&symbol).await;
                (symbol, quant)
            }
        });

        let mut out = HashMap::new();
        for (symbol, result) in join_all(tasks).await {
            if let Ok(quant) = result {
                out.insert(symbol, quant);
            }
        }
        out
    }

    async fn fetch_rankings(&self, cfg: &StrategyConfig) -> RankingSnapshots {
        let mut out = RankingSnapshots::default();

        if let Some(w) = &cfg.rankings.oi_change {
            match self.provider.oi_ranking(&w.duration, w.top_n).await {
                Ok(rows) => out.oi_change = rows,
                Err(e) => warn!(error = %e, "oi ranking snapshot omitted"),
            }
        }
        if let Some(w) = &cfg.rankings.net_flow {
            match self.provider.net_flow_ranking(&w.duration, w.top_n).await {
                Ok(rows) => out.net_flow = rows,
                Err(e) => warn!(error = %e, "net-flow ranking snapshot omitted"),
            }
        }
        if let Some(w) = &cfg.rankings.price_change {
            match self
                .provider
                .price_change_ranking(&w.duration, w.top_n)
                .await
            {
                Ok(rows) => out.price_change = rows,
                Err(e) => warn!(error = %e, "price-change ranking snapshot omitted"),
            }
        }
        out
    }
}

fn compute_indicators(klines: &[super::Kline], cfg: &IndicatorConfig) -> IndicatorSeries {
    let closes = indicators::closes(klines);
    let mut series = IndicatorSeries::default();

    if cfg.ema {
        for &period in &cfg.ema_periods {
            series.ema.insert(period, indicators::ema(&closes, period));
        }
    }
    if cfg.macd {
        series.macd = Some(indicators::macd(&closes));
    }
    if cfg.rsi {
        for &period in &cfg.rsi_periods {
            series.rsi.insert(period, indicators::rsi(&closes, period));
        }
    }
    if cfg.atr {
        for &period in &cfg.atr_periods {
            series.atr.insert(period, indicators::atr(klines, period));
        }
    }
    if cfg.boll {
        series.boll = Some(indicators::boll(&closes, 20, 2.0));
    }
    if cfg.volume {
        let volumes: Vec<f64> = klines.iter().map(|k| k.volume).collect();
        series.volume_sma = indicators::sma(&volumes, 20);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Kline, RankingEntry, StaticMarketProvider};
    use crate::store::CoinSource;

    fn klines(n: usize) -> Vec<Kline> {
        (0..n)
            .map(|i| Kline {
                open_time: i as i64 * 60_000,
                close_time: (i as i64 + 1) * 60_000,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + (i % 3) as f64,
                volume: 10.0,
                quote_volume: 1000.0,
                trade_count: 5,
            })
            .collect()
    }

    fn provider_with(symbols: &[&str]) -> Arc<StaticMarketProvider> {
        let provider = Arc::new(StaticMarketProvider::new());
        for s in symbols {
            provider.set_price(s, 100.0);
            for interval in ["15m", "1h", "4h"] {
                provider.set_klines(s, interval, klines(60));
            }
        }
        provider
    }

    #[tokio::test]
    async fn static_source_applies_exclusions_and_dedup() {
        let provider = provider_with(&["BTCUSDT", "ETHUSDT"]);
        let builder = ContextBuilder::new(provider, 30);
        let cfg = StrategyConfig {
            coin_source: CoinSource {
                mode: CoinSourceMode::Static,
                static_coins: vec!["btc".into(), "BTCUSDT".into(), "eth".into(), "doge".into()],
                top_n: 10,
                exclusions: vec!["DOGE".into()],
            },
            ..Default::default()
        };

        let ctx = builder
            .build(&cfg, AccountSnapshot::default(), Vec::new(), 1, 0)
            .await
            .unwrap();
        assert_eq!(ctx.candidates, vec!["BTCUSDT", "ETHUSDT"]);
        // DOGEUSDT excluded before fetch; the two live symbols have data.
        assert_eq!(ctx.market.len(), 2);
    }

    #[tokio::test]
    async fn failed_symbol_is_omitted_not_fatal() {
        let provider = provider_with(&["BTCUSDT"]);
        let builder = ContextBuilder::new(provider, 30);
        let cfg = StrategyConfig {
            coin_source: CoinSource {
                mode: CoinSourceMode::Static,
                static_coins: vec!["BTCUSDT".into(), "GHOSTUSDT".into()],
                ..Default::default()
            },
            ..Default::default()
        };

        let ctx = builder
            .build(&cfg, AccountSnapshot::default(), Vec::new(), 1, 0)
            .await
            .unwrap();
        assert_eq!(ctx.candidates.len(), 2);
        assert!(ctx.market.contains_key("BTCUSDT"));
        assert!(!ctx.market.contains_key("GHOSTUSDT"));
    }

    #[tokio::test]
    async fn mixed_source_unions_and_caps() {
        let provider = provider_with(&["BTCUSDT"]);
        provider.set_oi_ranking(vec![
            RankingEntry {
                base_coin: "SOL".into(),
                price: 150.0,
                change: 0.3,
            },
            RankingEntry {
                base_coin: "BTC".into(),
                price: 60000.0,
                change: 0.1,
            },
        ]);
        provider.set_curated(vec!["AVAX".into()]);

        let builder = ContextBuilder::new(provider, 3);
        let cfg = StrategyConfig {
            coin_source: CoinSource {
                mode: CoinSourceMode::Mixed,
                static_coins: vec!["BTCUSDT".into()],
                top_n: 5,
                exclusions: Vec::new(),
            },
            ..Default::default()
        };

        let ctx = builder
            .build(&cfg, AccountSnapshot::default(), Vec::new(), 1, 0)
            .await
            .unwrap();
        // dedup (BTC appears twice), then cap at 3
        assert_eq!(ctx.candidates, vec!["BTCUSDT", "SOLUSDT", "AVAXUSDT"]);
    }
}
