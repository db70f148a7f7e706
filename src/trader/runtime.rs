//! One long-lived cooperative task per trader.
//!
//! The loop selects between the stop signal and the scan-interval tick; each
//! tick runs one decision cycle inside its own spawned task so a panicking
//! cycle is absorbed without killing the runtime. Stopping never preempts an
//! in-flight cycle; the current one finishes before the task returns.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::decision::{self, engine::CycleDeps};
use crate::models::TradeDecision;
use crate::store::{DecisionRecord, StrategyConfig, Trader};

#[derive(Debug, Clone)]
pub struct TraderStatus {
    pub trader_id: String,
    pub name: String,
    pub is_running: bool,
    pub cycle_number: u64,
    pub call_count: u64,
    pub uptime_secs: u64,
}

pub struct TraderRuntime {
    trader: Trader,
    cfg: StrategyConfig,
    deps: CycleDeps,
    stop_tx: watch::Sender<bool>,
    is_running: AtomicBool,
    cycle_number: AtomicU64,
    call_count: AtomicU64,
    custom_prompt: parking_lot::RwLock<Option<String>>,
    started_at: parking_lot::RwLock<Option<Instant>>,
}

impl TraderRuntime {
    pub fn new(trader: Trader, cfg: StrategyConfig, deps: CycleDeps) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            trader,
            cfg,
            deps,
            stop_tx,
            is_running: AtomicBool::new(false),
            cycle_number: AtomicU64::new(0),
            call_count: AtomicU64::new(0),
            custom_prompt: parking_lot::RwLock::new(None),
            started_at: parking_lot::RwLock::new(None),
        })
    }

    pub fn trader(&self) -> &Trader {
        &self.trader
    }

    pub fn deps(&self) -> &CycleDeps {
        &self.deps
    }

    pub fn set_custom_prompt(&self, prompt: Option<String>) {
        *self.custom_prompt.write() = prompt;
    }

    pub fn status(&self) -> TraderStatus {
        TraderStatus {
            trader_id: self.trader.id.clone(),
            name: self.trader.name.clone(),
            is_running: self.is_running.load(Ordering::SeqCst),
            cycle_number: self.cycle_number.load(Ordering::SeqCst),
            call_count: self.call_count.load(Ordering::SeqCst),
            uptime_secs: self
                .started_at
                .read()
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
        }
    }

    /// Start the cycle loop. Idempotent: a second start while running is a
    /// no-op returning an error.
    pub fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("trader {} already running", self.trader.name));
        }
        // fresh stop value for this run
        self.stop_tx.send_replace(false);
        *self.started_at.write() = Some(Instant::now());

        Ok(tokio::spawn(async move { self.run().await }))
    }

    async fn run(self: Arc<Self>) {
        if let Err(e) = self
            .deps
            .store
            .set_trader_running(&self.trader.id, true)
            .await
        {
            warn!(trader = %self.trader.name, error = %e, "could not persist running=true");
        }
        info!(trader = %self.trader.name, interval_min = self.trader.scan_interval_min, "trader started");

        let period = Duration::from_secs(u64::from(self.trader.scan_interval_min) * 60);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            // Catches a stop that raced the subscription above.
            if *self.stop_tx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        if let Err(e) = self
            .deps
            .store
            .set_trader_running(&self.trader.id, false)
            .await
        {
            warn!(trader = %self.trader.name, error = %e, "could not persist running=false");
        }
        info!(trader = %self.trader.name, "trader stopped");
    }

    /// One tick: bump the cycle counter and run the pipeline in a child task
    /// so a panic in cycle code is one skipped cycle, not a dead trader.
    async fn tick(&self) {
        let cycle = self.cycle_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let uptime = self.status().uptime_secs;
        let custom = self.custom_prompt.read().clone();

        let deps = self.deps.clone();
        let trader = self.trader.clone();
        let cfg = self.cfg.clone();
        let handle = tokio::spawn(async move {
            decision::run_cycle(&deps, &trader, &cfg, cycle, uptime, custom.as_deref()).await
        });

        match handle.await {
            Ok(outcome) => {
                info!(
                    trader = %self.trader.name,
                    cycle,
                    success = outcome.record.success,
                    orders = outcome.orders_submitted,
                    "cycle finished"
                );
            }
            Err(join_err) if join_err.is_panic() => {
                error!(trader = %self.trader.name, cycle, "cycle panicked, recording and continuing");
                let record = DecisionRecord {
                    trader_id: self.trader.id.clone(),
                    cycle_number: cycle,
                    created_at: chrono::Utc::now().timestamp_millis(),
                    success: false,
                    error_message: "cycle panicked".to_string(),
                    ..Default::default()
                };
                if let Err(e) = self.deps.store.insert_decision_record(record).await {
                    warn!(trader = %self.trader.name, error = %e, "could not record panic cycle");
                }
            }
            Err(join_err) => {
                warn!(trader = %self.trader.name, cycle, error = %join_err, "cycle task aborted");
            }
        }
    }

    /// Signal the loop to exit. The flag flips immediately; the loop persists
    /// the stopped state when the current cycle (if any) completes.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    /// External entry used by the debate executor: one decision through the
    /// same risk-enforced submission path, outside the cycle loop.
    pub async fn execute_decision(&self, decision: TradeDecision) -> Result<Vec<String>> {
        let account = self.deps.adapter.account_info().await?;
        let positions = self.deps.store.list_open_positions(&self.trader.id).await?;
        let (approved, mut log) =
            decision::enforce_risk(vec![decision], &account, &positions, &self.cfg.risk);

        if approved.is_empty() {
            return Ok(log);
        }

        // Mark prices resolve through the adapter on this path.
        let market = std::collections::HashMap::new();
        let submitted =
            decision::engine::execute_sized(&self.deps, &self.trader, &market, &approved, &mut log)
                .await;
        self.call_count.fetch_add(1, Ordering::SeqCst);
        info!(trader = %self.trader.name, submitted, "external decision executed");
        Ok(log)
    }
}
