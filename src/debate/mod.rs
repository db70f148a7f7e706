//! Multi-model debate: several model endpoints argue over the same market
//! context across rounds, vote, and converge on a consensus decision an
//! executor may act on.

pub mod consensus;
pub mod engine;
pub mod executor;
pub mod personality;

pub use consensus::compute_consensus;
pub use engine::DebateEngine;
pub use executor::execute_consensus;

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::store::{DebateMessage, DebateStatus, DebateVote};
use crate::models::TradeDecision;

/// Events fanned out to subscribers of one session, in debate order.
#[derive(Debug, Clone)]
pub enum DebateEvent {
    Status(DebateStatus),
    RoundStart(u32),
    Message(DebateMessage),
    RoundEnd(u32),
    Vote(DebateVote),
    Consensus(TradeDecision),
    /// A participant failed or timed out; the debate continues without it.
    ParticipantError { participant: String, message: String },
}

/// Per-session broadcast channels. Subscribers that lag simply miss events;
/// the persisted messages remain the durable record.
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<DebateEvent>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl EventHub {
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<DebateEvent> {
        self.sender(session_id).subscribe()
    }

    pub(crate) fn sender(&self, session_id: &str) -> broadcast::Sender<DebateEvent> {
        self.channels
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    pub(crate) fn emit(&self, session_id: &str, event: DebateEvent) {
        let _ = self.sender(session_id).send(event);
    }

    pub(crate) fn drop_session(&self, session_id: &str) {
        self.channels.lock().remove(session_id);
    }
}
