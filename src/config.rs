//! Process configuration, read once at startup from the environment.

use std::env;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Sqlite database path.
    pub db_path: String,
    /// Route every venue to the in-memory paper adapter instead of live venues.
    pub paper_trading: bool,
    /// Symmetric key for credential ciphertext; the cipher lives outside this
    /// service, we only refuse to start without a key.
    pub encryption_key: String,
    pub registration_enabled: bool,
    pub max_users: usize,

    /// Base URL for the kline / ranking market-data provider.
    pub market_base_url: String,
    /// Optional API key for the ranking provider.
    pub market_api_key: Option<String>,

    /// Model-call budget per attempt.
    pub model_timeout: Duration,
    pub model_max_attempts: u32,
    pub model_retry_base_delay: Duration,

    /// Candidate-universe hard cap after mixing sources.
    pub max_candidates: usize,

    /// Competition snapshot tuning.
    pub competition_cache_ttl: Duration,
    pub competition_row_timeout: Duration,
    pub competition_max_rows: usize,

    /// Fill-sync loop cadence.
    pub fill_sync_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "fleetbot.db".to_string(),
            paper_trading: true,
            encryption_key: String::new(),
            registration_enabled: true,
            max_users: 100,
            market_base_url: "https://fapi.binance.com".to_string(),
            market_api_key: None,
            model_timeout: Duration::from_secs(60),
            model_max_attempts: 3,
            model_retry_base_delay: Duration::from_secs(2),
            max_candidates: 30,
            competition_cache_ttl: Duration::from_secs(30),
            competition_row_timeout: Duration::from_secs(3),
            competition_max_rows: 50,
            fill_sync_interval: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: env_string("FLEETBOT_DB_PATH", &d.db_path),
            paper_trading: env_bool("FLEETBOT_PAPER", d.paper_trading),
            encryption_key: env_string("FLEETBOT_ENCRYPTION_KEY", ""),
            registration_enabled: env_bool("FLEETBOT_REGISTRATION", d.registration_enabled),
            max_users: env_usize("FLEETBOT_MAX_USERS", d.max_users),
            market_base_url: env_string("FLEETBOT_MARKET_BASE_URL", &d.market_base_url),
            market_api_key: env::var("FLEETBOT_MARKET_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            model_timeout: Duration::from_secs(env_u64(
                "FLEETBOT_MODEL_TIMEOUT_SEC",
                d.model_timeout.as_secs(),
            )),
            model_max_attempts: env_u64("FLEETBOT_MODEL_MAX_ATTEMPTS", 3).clamp(1, 10) as u32,
            model_retry_base_delay: Duration::from_millis(env_u64(
                "FLEETBOT_MODEL_RETRY_BASE_MS",
                d.model_retry_base_delay.as_millis() as u64,
            )),
            max_candidates: env_usize("FLEETBOT_MAX_CANDIDATES", d.max_candidates).clamp(1, 100),
            competition_cache_ttl: Duration::from_secs(env_u64(
                "FLEETBOT_COMPETITION_CACHE_SEC",
                d.competition_cache_ttl.as_secs(),
            )),
            competition_row_timeout: Duration::from_secs(env_u64(
                "FLEETBOT_COMPETITION_ROW_TIMEOUT_SEC",
                d.competition_row_timeout.as_secs(),
            )),
            competition_max_rows: env_usize(
                "FLEETBOT_COMPETITION_MAX_ROWS",
                d.competition_max_rows,
            ),
            fill_sync_interval: Duration::from_secs(env_u64(
                "FLEETBOT_FILL_SYNC_SEC",
                d.fill_sync_interval.as_secs(),
            )),
        }
    }
}
