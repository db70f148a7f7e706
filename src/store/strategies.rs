use anyhow::{anyhow, Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, now_ms, Store};
use crate::models::PromptVariant;

/// How the candidate-coin universe is produced each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSourceMode {
    Static,
    OiTop,
    Ai500,
    Mixed,
}

impl Default for CoinSourceMode {
    fn default() -> Self {
        CoinSourceMode::Static
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinSource {
    #[serde(default)]
    pub mode: CoinSourceMode,
    #[serde(default)]
    pub static_coins: Vec<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

fn default_top_n() -> usize {
    10
}

impl Default for CoinSource {
    fn default() -> Self {
        Self {
            mode: CoinSourceMode::default(),
            static_coins: Vec::new(),
            top_n: default_top_n(),
            exclusions: Vec::new(),
        }
    }
}

/// Indicator switches. Raw OHLCV is always on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub ema: bool,
    #[serde(default = "default_ema_periods")]
    pub ema_periods: Vec<usize>,
    #[serde(default)]
    pub macd: bool,
    #[serde(default)]
    pub rsi: bool,
    #[serde(default = "default_rsi_periods")]
    pub rsi_periods: Vec<usize>,
    #[serde(default)]
    pub atr: bool,
    #[serde(default = "default_atr_periods")]
    pub atr_periods: Vec<usize>,
    #[serde(default)]
    pub boll: bool,
    #[serde(default)]
    pub volume: bool,
    #[serde(default)]
    pub open_interest: bool,
    #[serde(default)]
    pub funding_rate: bool,
    /// Timeframes for the multi-timeframe tables, e.g. ["15m","1h","4h"].
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
}

fn default_ema_periods() -> Vec<usize> {
    vec![20, 50]
}

fn default_rsi_periods() -> Vec<usize> {
    vec![14]
}

fn default_atr_periods() -> Vec<usize> {
    vec![14]
}

fn default_timeframes() -> Vec<String> {
    vec!["15m".to_string(), "1h".to_string(), "4h".to_string()]
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema: true,
            ema_periods: default_ema_periods(),
            macd: true,
            rsi: true,
            rsi_periods: default_rsi_periods(),
            atr: false,
            atr_periods: default_atr_periods(),
            boll: false,
            volume: true,
            open_interest: false,
            funding_rate: false,
            timeframes: default_timeframes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingWindow {
    /// Provider window, e.g. "24h" or "4h".
    pub duration: String,
    pub top_n: usize,
}

impl Default for RankingWindow {
    fn default() -> Self {
        Self {
            duration: "24h".to_string(),
            top_n: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default)]
    pub oi_change: Option<RankingWindow>,
    #[serde(default)]
    pub net_flow: Option<RankingWindow>,
    #[serde(default)]
    pub price_change: Option<RankingWindow>,
}

/// Risk controls. The `max_*`/`min_position` family is enforced in code and
/// overrides model output; the advisory fields are surfaced to the model in
/// the prompt but not rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_btc_eth_ratio")]
    pub btc_eth_max_position_value_ratio: f64,
    #[serde(default = "default_altcoin_ratio")]
    pub altcoin_max_position_value_ratio: f64,
    #[serde(default = "default_min_position")]
    pub min_position_size_usd: f64,
    #[serde(default = "default_max_margin")]
    pub max_margin_usage: f64,

    // Advisory caps, surfaced to the model.
    #[serde(default = "default_lev_btc_eth")]
    pub max_leverage_btc_eth: u32,
    #[serde(default = "default_lev_alt")]
    pub max_leverage_altcoin: u32,
    #[serde(default = "default_min_rr")]
    pub min_risk_reward: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_max_positions() -> usize {
    3
}
fn default_btc_eth_ratio() -> f64 {
    5.0
}
fn default_altcoin_ratio() -> f64 {
    1.5
}
fn default_min_position() -> f64 {
    12.0
}
fn default_max_margin() -> f64 {
    0.9
}
fn default_lev_btc_eth() -> u32 {
    10
}
fn default_lev_alt() -> u32 {
    5
}
fn default_min_rr() -> f64 {
    1.5
}
fn default_min_confidence() -> f64 {
    60.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            btc_eth_max_position_value_ratio: default_btc_eth_ratio(),
            altcoin_max_position_value_ratio: default_altcoin_ratio(),
            min_position_size_usd: default_min_position(),
            max_margin_usage: default_max_margin(),
            max_leverage_btc_eth: default_lev_btc_eth(),
            max_leverage_altcoin: default_lev_alt(),
            min_risk_reward: default_min_rr(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// User-editable prompt sections, concatenated into the system prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSections {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub trading_frequency: String,
    #[serde(default)]
    pub entry_standards: String,
    #[serde(default)]
    pub decision_process: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// "zh" or "en".
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub coin_source: CoinSource,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub rankings: RankingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub prompts: PromptSections,
    #[serde(default)]
    pub variant: PromptVariant,
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            coin_source: CoinSource::default(),
            indicators: IndicatorConfig::default(),
            rankings: RankingConfig::default(),
            risk: RiskConfig::default(),
            prompts: PromptSections::default(),
            variant: PromptVariant::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub is_default: bool,
    pub is_public: bool,
    pub config_visible: bool,
    pub config: StrategyConfig,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_strategy(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Strategy, String)> {
    let config_json: String = row.get(6)?;
    Ok((
        Strategy {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            is_default: row.get::<_, i64>(3)? != 0,
            is_public: row.get::<_, i64>(4)? != 0,
            config_visible: row.get::<_, i64>(5)? != 0,
            config: StrategyConfig::default(),
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        },
        config_json,
    ))
}

fn finish(pair: (Strategy, String)) -> Result<Strategy> {
    let (mut strategy, config_json) = pair;
    strategy.config =
        serde_json::from_str(&config_json).context("parse strategy config json")?;
    Ok(strategy)
}

const COLUMNS: &str =
    "id, user_id, name, is_default, is_public, config_visible, config, created_at, updated_at";

impl Store {
    pub async fn create_strategy(&self, mut strategy: Strategy) -> Result<Strategy> {
        if strategy.name.trim().is_empty() {
            return Err(anyhow!("strategy name required"));
        }
        if strategy.id.is_empty() {
            strategy.id = new_id();
        }
        strategy.created_at = now_ms();
        strategy.updated_at = strategy.created_at;
        let config_json = serde_json::to_string(&strategy.config)?;

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO strategies (id, user_id, name, is_default, is_public, config_visible, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &strategy.id,
                &strategy.user_id,
                &strategy.name,
                strategy.is_default as i64,
                strategy.is_public as i64,
                strategy.config_visible as i64,
                &config_json,
                strategy.created_at,
                strategy.updated_at
            ],
        )?;
        Ok(strategy)
    }

    pub async fn get_strategy(&self, id: &str) -> Result<Option<Strategy>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {COLUMNS} FROM strategies WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let pair = row_to_strategy(row)?;
        drop(rows);
        Ok(Some(finish(pair)?))
    }

    pub async fn list_strategies(&self, user_id: &str) -> Result<Vec<Strategy>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM strategies WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let pairs = stmt
            .query_map(params![user_id], row_to_strategy)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        pairs.into_iter().map(finish).collect()
    }

    pub async fn update_strategy(&self, strategy: &Strategy) -> Result<()> {
        let config_json = serde_json::to_string(&strategy.config)?;
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE strategies SET name = ?2, is_public = ?3, config_visible = ?4,
             config = ?5, updated_at = ?6 WHERE id = ?1",
            params![
                &strategy.id,
                &strategy.name,
                strategy.is_public as i64,
                strategy.config_visible as i64,
                &config_json,
                now_ms()
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("strategy {} not found", strategy.id));
        }
        Ok(())
    }

    /// Make one strategy the user's default, clearing siblings atomically.
    pub async fn set_default_strategy(&self, user_id: &str, strategy_id: &str) -> Result<()> {
        let mut conn = self.conn().lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE strategies SET is_default = 0 WHERE user_id = ?1",
            params![user_id],
        )?;
        let changed = tx.execute(
            "UPDATE strategies SET is_default = 1 WHERE id = ?1 AND user_id = ?2",
            params![strategy_id, user_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("strategy {strategy_id} not found for user {user_id}"));
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn delete_strategy(&self, id: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute("DELETE FROM strategies WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user_id: &str, name: &str) -> Strategy {
        Strategy {
            id: String::new(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            is_default: false,
            is_public: false,
            config_visible: false,
            config: StrategyConfig::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn config_json_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut strategy = sample("u1", "momentum");
        strategy.config.coin_source.mode = CoinSourceMode::Mixed;
        strategy.config.coin_source.static_coins = vec!["BTCUSDT".to_string()];
        strategy.config.risk.max_positions = 5;

        let created = store.create_strategy(strategy).await.unwrap();
        let loaded = store.get_strategy(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.config.coin_source.mode, CoinSourceMode::Mixed);
        assert_eq!(loaded.config.risk.max_positions, 5);
        assert_eq!(loaded.config.risk.min_position_size_usd, 12.0);
    }

    #[tokio::test]
    async fn set_default_clears_siblings() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_strategy(sample("u1", "a")).await.unwrap();
        let b = store.create_strategy(sample("u1", "b")).await.unwrap();

        store.set_default_strategy("u1", &a.id).await.unwrap();
        store.set_default_strategy("u1", &b.id).await.unwrap();

        let all = store.list_strategies("u1").await.unwrap();
        let defaults: Vec<_> = all.iter().filter(|s| s.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, b.id);
    }

    #[tokio::test]
    async fn empty_config_column_uses_defaults() {
        let store = Store::open_in_memory().unwrap();
        let created = store.create_strategy(sample("u1", "bare")).await.unwrap();
        let loaded = store.get_strategy(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.config.language, "en");
        assert_eq!(loaded.config.variant, PromptVariant::Balanced);
    }
}
