//! Process-wide trader registry: load, start, stop, remove, auto-restore,
//! and the cached competition snapshot.

use anyhow::{anyhow, Context as _, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::decision::engine::CycleDeps;
use crate::exchange::adapter_for;
use crate::llm::{reveal_key, ChatClient, ModelClient, RetryPolicy};
use crate::market::{ContextBuilder, MarketDataProvider};
use crate::models::round2;
use crate::reconcile::Reconciler;
use crate::store::{Store, Trader};
use crate::trader::TraderRuntime;

#[derive(Debug, Clone, Serialize)]
pub struct CompetitionRow {
    pub trader_id: String,
    pub name: String,
    pub total_equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
    pub is_running: bool,
    pub model: String,
    pub exchange: String,
    /// Set when the snapshot for this row timed out or failed; numeric
    /// fields are zeros in that case.
    pub error: Option<String>,
}

struct CompetitionCache {
    at: Instant,
    rows: Vec<CompetitionRow>,
}

pub struct TraderManager {
    store: Store,
    cfg: AppConfig,
    http: reqwest::Client,
    provider: Arc<dyn MarketDataProvider>,
    registry: RwLock<HashMap<String, Arc<TraderRuntime>>>,
    load_errors: parking_lot::RwLock<HashMap<String, String>>,
    competition: parking_lot::RwLock<Option<CompetitionCache>>,
}

impl TraderManager {
    pub fn new(
        store: Store,
        cfg: AppConfig,
        http: reqwest::Client,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cfg,
            http,
            provider,
            registry: RwLock::new(HashMap::new()),
            load_errors: parking_lot::RwLock::new(HashMap::new()),
            competition: parking_lot::RwLock::new(None),
        })
    }

    /// Wire one trader row into a runtime. Failures are retained in
    /// `load_errors` keyed by trader id and the trader stays out of the
    /// registry.
    async fn build_runtime(&self, trader: &Trader) -> Result<Arc<TraderRuntime>> {
        let strategy = self
            .store
            .get_strategy(&trader.strategy_id)
            .await?
            .ok_or_else(|| anyhow!("strategy {} missing", trader.strategy_id))?;

        let model_cfg = self
            .store
            .get_model_config(&trader.model_config_id)
            .await?
            .ok_or_else(|| anyhow!("model config {} missing", trader.model_config_id))?;
        if !model_cfg.enabled {
            return Err(anyhow!("model config {} is disabled", model_cfg.id));
        }

        let account = self
            .store
            .get_exchange_account(&trader.exchange_account_id)
            .await?
            .ok_or_else(|| anyhow!("exchange account {} missing", trader.exchange_account_id))?;
        if !account.enabled {
            return Err(anyhow!("exchange account {} is disabled", account.id));
        }

        let client: Arc<dyn ModelClient> = Arc::new(
            ChatClient::for_provider(
                self.http.clone(),
                &model_cfg.provider,
                &reveal_key(&model_cfg.api_key),
                model_cfg.base_url.as_deref(),
                model_cfg.model_name.as_deref(),
            )
            .with_retry(RetryPolicy::new(
                self.cfg.model_max_attempts,
                self.cfg.model_retry_base_delay,
            ))
            .with_timeout(self.cfg.model_timeout),
        );

        let adapter = adapter_for(&account, self.cfg.paper_trading, trader.initial_balance)
            .context("resolve exchange adapter")?;

        let deps = CycleDeps {
            store: self.store.clone(),
            context: Arc::new(ContextBuilder::new(
                Arc::clone(&self.provider),
                self.cfg.max_candidates,
            )),
            client,
            adapter,
            reconciler: Reconciler::new(self.store.clone()),
            model_timeout: self.cfg.model_timeout,
        };

        Ok(TraderRuntime::new(trader.clone(), strategy.config, deps))
    }

    /// Load every trader of one user into the registry.
    pub async fn load_user(&self, user_id: &str) -> Result<usize> {
        let traders = self.store.list_traders_for_user(user_id).await?;
        self.load_traders(traders).await
    }

    /// Load every trader in the database.
    pub async fn load_all(&self) -> Result<usize> {
        let traders = self.store.list_traders().await?;
        self.load_traders(traders).await
    }

    async fn load_traders(&self, traders: Vec<Trader>) -> Result<usize> {
        let mut loaded = 0usize;
        for trader in traders {
            if self.registry.read().await.contains_key(&trader.id) {
                continue;
            }
            match self.build_runtime(&trader).await {
                Ok(runtime) => {
                    self.registry
                        .write()
                        .await
                        .insert(trader.id.clone(), runtime);
                    self.load_errors.write().remove(&trader.id);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(trader = %trader.name, error = %e, "trader left out of registry");
                    self.load_errors
                        .write()
                        .insert(trader.id.clone(), format!("{e:#}"));
                }
            }
        }
        info!(loaded, "traders loaded");
        Ok(loaded)
    }

    /// Insert a pre-built runtime (tests, custom wiring).
    pub async fn add(&self, runtime: Arc<TraderRuntime>) {
        let id = runtime.trader().id.clone();
        self.registry.write().await.insert(id, runtime);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TraderRuntime>> {
        self.registry.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<TraderRuntime>> {
        self.registry.read().await.values().cloned().collect()
    }

    pub fn load_error(&self, id: &str) -> Option<String> {
        self.load_errors.read().get(id).cloned()
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let runtime = self
            .get(id)
            .await
            .ok_or_else(|| anyhow!("trader {id} not in registry"))?;
        runtime.start()?;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let runtime = self
            .get(id)
            .await
            .ok_or_else(|| anyhow!("trader {id} not in registry"))?;
        runtime.stop();
        Ok(())
    }

    /// Remove a trader from the registry. A running runtime is stopped
    /// first so its cycle task exits.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.registry.write().await.remove(id);
        match removed {
            Some(runtime) => {
                if runtime.status().is_running {
                    runtime.stop();
                }
                self.load_errors.write().remove(id);
                Ok(())
            }
            None => Err(anyhow!("trader {id} not in registry")),
        }
    }

    pub async fn start_all(&self) -> usize {
        let mut started = 0usize;
        for runtime in self.list().await {
            if runtime.start().is_ok() {
                started += 1;
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        for runtime in self.list().await {
            runtime.stop();
        }
    }

    /// Restore runtimes whose persisted `is_running` flag survived a
    /// restart.
    pub async fn auto_start_running_traders(&self) -> Result<usize> {
        let mut started = 0usize;
        for runtime in self.list().await {
            let Some(row) = self.store.get_trader(&runtime.trader().id).await? else {
                continue;
            };
            if row.is_running && runtime.start().is_ok() {
                started += 1;
            }
        }
        info!(started, "auto-restored running traders");
        Ok(started)
    }

    /// Pull fresh fills for every registered trader (periodic catch-up).
    pub async fn sync_all_fills(&self) {
        for runtime in self.list().await {
            let trader = runtime.trader();
            let deps = runtime.deps();
            if let Err(e) = deps
                .reconciler
                .sync_fills(&trader.id, &trader.exchange_account_id, &deps.adapter)
                .await
            {
                warn!(trader = %trader.name, error = %e, "fill sync failed");
            }
        }
    }

    /// Competition leaderboard. Cached for `competition_cache_ttl`; a
    /// refresh fans out one account call per visible trader with a hard
    /// per-row deadline, fills zeros on timeout, sorts by pnl% and caps the
    /// row count.
    pub async fn competition_data(&self) -> Vec<CompetitionRow> {
        if let Some(cache) = self.competition.read().as_ref() {
            if cache.at.elapsed() < self.cfg.competition_cache_ttl {
                return cache.rows.clone();
            }
        }

        let runtimes: Vec<Arc<TraderRuntime>> = self
            .list()
            .await
            .into_iter()
            .filter(|r| r.trader().show_in_competition)
            .collect();

        let row_timeout = self.cfg.competition_row_timeout;
        let tasks = runtimes.iter().map(|runtime| {
            let runtime = Arc::clone(runtime);
            async move {
                let trader = runtime.trader().clone();
                let status = runtime.status();
                match timeout(row_timeout, runtime.deps().adapter.account_info()).await {
                    Ok(Ok(info)) => {
                        let pnl = info.total_equity - trader.initial_balance;
                        let pnl_pct = if trader.initial_balance > 0.0 {
                            pnl / trader.initial_balance * 100.0
                        } else {
                            0.0
                        };
                        CompetitionRow {
                            trader_id: trader.id,
                            name: trader.name,
                            total_equity: round2(info.total_equity),
                            pnl: round2(pnl),
                            pnl_pct: round2(pnl_pct),
                            position_count: info.position_count,
                            margin_used_pct: round2(info.margin_used_pct),
                            is_running: status.is_running,
                            model: trader.model_config_id,
                            exchange: trader.exchange_account_id,
                            error: None,
                        }
                    }
                    Ok(Err(e)) => zero_row(&trader, status.is_running, format!("{e:#}")),
                    Err(_) => zero_row(&trader, status.is_running, "timeout".to_string()),
                }
            }
        });

        let mut rows = join_all(tasks).await;
        rows.sort_by(|a, b| {
            b.pnl_pct
                .partial_cmp(&a.pnl_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(self.cfg.competition_max_rows);

        *self.competition.write() = Some(CompetitionCache {
            at: Instant::now(),
            rows: rows.clone(),
        });
        rows
    }
}

fn zero_row(trader: &Trader, is_running: bool, error: String) -> CompetitionRow {
    CompetitionRow {
        trader_id: trader.id.clone(),
        name: trader.name.clone(),
        total_equity: 0.0,
        pnl: 0.0,
        pnl_pct: 0.0,
        position_count: 0,
        margin_used_pct: 0.0,
        is_running,
        model: trader.model_config_id.clone(),
        exchange: trader.exchange_account_id.clone(),
        error: Some(error),
    }
}
