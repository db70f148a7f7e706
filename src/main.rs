//! Fleetbot - multi-tenant orchestrator for AI-driven futures traders.
//!
//! Startup order matters: the store open runs schema migrations and the
//! stale-debate sweep before any engine touches the database, then traders
//! with a persisted running flag are restored.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetbot_backend::config::AppConfig;
use fleetbot_backend::llm;
use fleetbot_backend::market::HttpMarketProvider;
use fleetbot_backend::store::Store;
use fleetbot_backend::trader::TraderManager;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AppConfig::from_env();
    if cfg.encryption_key.trim().is_empty() {
        return Err(anyhow!(
            "FLEETBOT_ENCRYPTION_KEY is required to load credentials"
        ));
    }
    info!(db = %cfg.db_path, paper = cfg.paper_trading, "fleetbot starting");

    // Opens the database, applies legacy migrations, cancels stale debates.
    let store = Store::open(&cfg.db_path).context("open store")?;

    llm::set_usage_hook(|model, usage| {
        debug!(model, total_tokens = usage.total_tokens, "token usage");
    });

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()
        .context("build http client")?;

    let provider = Arc::new(HttpMarketProvider::new(
        http.clone(),
        cfg.market_base_url.clone(),
        None,
        cfg.market_api_key.clone(),
    ));

    let manager = TraderManager::new(store.clone(), cfg.clone(), http, provider);
    manager.load_all().await.context("load traders")?;
    manager.auto_start_running_traders().await?;

    // Periodic catch-up against exchange truth for every registered trader.
    {
        let manager = Arc::clone(&manager);
        let sync_interval = cfg.fill_sync_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sync_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.sync_all_fills().await;
            }
        });
    }

    info!("fleetbot running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    info!("shutting down");
    manager.stop_all().await;
    // Give in-flight cycles a moment to persist their records.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
