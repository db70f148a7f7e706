//! The per-cycle decision pipeline: prompt assembly, model invocation,
//! structured-response parsing, and code-enforced risk caps.

pub mod engine;
pub mod parser;
pub mod prompt;
pub mod risk;

pub use engine::{run_cycle, CycleDeps, CycleOutcome};
pub use parser::{parse_response, ParsedResponse};
pub use risk::{enforce_risk, SizedDecision};
