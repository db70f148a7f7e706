//! Per-trader runtimes and the process-wide manager.

pub mod manager;
pub mod runtime;

pub use manager::{CompetitionRow, TraderManager};
pub use runtime::{TraderRuntime, TraderStatus};
