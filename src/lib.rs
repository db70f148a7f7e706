//! Fleetbot backend library.
//!
//! Core modules for the trader orchestrator: persistence, market data,
//! model clients, the decision pipeline, reconciliation, trader runtimes,
//! and the debate engine. Binaries and integration tests wire these
//! together.

pub mod config;
pub mod debate;
pub mod decision;
pub mod exchange;
pub mod llm;
pub mod market;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod trader;

pub use config::AppConfig;
pub use reconcile::{Reconciler, TradeUpdate};
pub use store::Store;
pub use trader::{TraderManager, TraderRuntime};
