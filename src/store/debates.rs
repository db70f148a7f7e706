use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::{new_id, now_ms, Store};
use crate::models::{PromptVariant, TradeDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebateStatus {
    Pending,
    Running,
    Voting,
    Completed,
    Cancelled,
}

impl DebateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebateStatus::Pending => "pending",
            DebateStatus::Running => "running",
            DebateStatus::Voting => "voting",
            DebateStatus::Completed => "completed",
            DebateStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(DebateStatus::Pending),
            "running" => Some(DebateStatus::Running),
            "voting" => Some(DebateStatus::Voting),
            "completed" => Some(DebateStatus::Completed),
            "cancelled" => Some(DebateStatus::Cancelled),
            _ => None,
        }
    }

    /// Forward-only, except `running|voting -> cancelled`.
    pub fn can_transition_to(&self, next: DebateStatus) -> bool {
        use DebateStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Voting)
                | (Voting, Completed)
                | (Running, Cancelled)
                | (Voting, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    Bull,
    Bear,
    Analyst,
    Contrarian,
    RiskManager,
}

impl Personality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Personality::Bull => "bull",
            Personality::Bear => "bear",
            Personality::Analyst => "analyst",
            Personality::Contrarian => "contrarian",
            Personality::RiskManager => "risk_manager",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bull" => Some(Personality::Bull),
            "bear" => Some(Personality::Bear),
            "analyst" => Some(Personality::Analyst),
            "contrarian" => Some(Personality::Contrarian),
            "risk_manager" => Some(Personality::RiskManager),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSession {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub strategy_id: String,
    pub status: DebateStatus,
    /// Declared subject coin; None lets the debate range over candidates.
    pub symbol: Option<String>,
    pub max_rounds: u32,
    pub current_round: u32,
    pub interval_minutes: u32,
    pub prompt_variant: PromptVariant,
    pub auto_execute: bool,
    pub trader_id: Option<String>,
    pub oi_ranking_top_n: usize,
    pub oi_ranking_duration: String,
    pub final_decisions: Vec<TradeDecision>,
    pub primary_decision: Option<TradeDecision>,
    pub executed: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateParticipant {
    pub id: String,
    pub session_id: String,
    pub model_config_id: String,
    pub name: String,
    pub personality: Personality,
    pub sort_order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateMessage {
    pub id: String,
    pub session_id: String,
    pub round: u32,
    pub participant_id: String,
    pub author: String,
    pub personality: Personality,
    /// "analysis", "rebuttal", "final", or "vote".
    pub message_type: String,
    pub content: String,
    pub decisions: Vec<TradeDecision>,
    pub confidence: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateVote {
    pub id: String,
    pub session_id: String,
    pub participant_id: String,
    pub author: String,
    pub decisions: Vec<TradeDecision>,
    pub created_at: i64,
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<DebateSession> {
    let status_raw: String = row.get(4)?;
    let variant_raw: String = row.get(9)?;
    let final_raw: String = row.get(14)?;
    let primary_raw: String = row.get(15)?;
    Ok(DebateSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        strategy_id: row.get(3)?,
        status: DebateStatus::parse(&status_raw).unwrap_or(DebateStatus::Pending),
        symbol: row.get(5)?,
        max_rounds: row.get::<_, i64>(6)?.max(1) as u32,
        current_round: row.get::<_, i64>(7)?.max(0) as u32,
        interval_minutes: row.get::<_, i64>(8)?.max(0) as u32,
        prompt_variant: PromptVariant::parse(&variant_raw).unwrap_or_default(),
        auto_execute: row.get::<_, i64>(10)? != 0,
        trader_id: row.get(11)?,
        oi_ranking_top_n: row.get::<_, i64>(12)?.max(0) as usize,
        oi_ranking_duration: row.get(13)?,
        final_decisions: serde_json::from_str(&final_raw).unwrap_or_default(),
        primary_decision: serde_json::from_str(&primary_raw).ok(),
        executed: row.get::<_, i64>(16)? != 0,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, name, strategy_id, status, symbol, max_rounds,
    current_round, interval_minutes, prompt_variant, auto_execute, trader_id, oi_ranking_top_n,
    oi_ranking_duration, final_decisions, primary_decision, executed, created_at, updated_at";

impl Store {
    pub async fn create_debate_session(&self, mut session: DebateSession) -> Result<DebateSession> {
        if session.id.is_empty() {
            session.id = new_id();
        }
        session.created_at = now_ms();
        session.updated_at = session.created_at;

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO debate_sessions (id, user_id, name, strategy_id, status, symbol,
             max_rounds, current_round, interval_minutes, prompt_variant, auto_execute, trader_id,
             oi_ranking_top_n, oi_ranking_duration, final_decisions, primary_decision, executed,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                &session.id,
                &session.user_id,
                &session.name,
                &session.strategy_id,
                session.status.as_str(),
                session.symbol.as_deref(),
                session.max_rounds as i64,
                session.current_round as i64,
                session.interval_minutes as i64,
                session.prompt_variant.as_str(),
                session.auto_execute as i64,
                session.trader_id.as_deref(),
                session.oi_ranking_top_n as i64,
                &session.oi_ranking_duration,
                serde_json::to_string(&session.final_decisions)?,
                session
                    .primary_decision
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?
                    .unwrap_or_default(),
                session.executed as i64,
                session.created_at,
                session.updated_at
            ],
        )?;
        Ok(session)
    }

    pub async fn get_debate_session(&self, id: &str) -> Result<Option<DebateSession>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SESSION_COLUMNS} FROM debate_sessions WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_session(row)?))
    }

    /// Guarded status transition; rejects anything the state machine forbids.
    pub async fn transition_debate_status(
        &self,
        id: &str,
        next: DebateStatus,
    ) -> Result<DebateSession> {
        let Some(session) = self.get_debate_session(id).await? else {
            return Err(anyhow!("debate session {id} not found"));
        };
        if !session.status.can_transition_to(next) {
            return Err(anyhow!(
                "illegal debate transition {} -> {}",
                session.status.as_str(),
                next.as_str()
            ));
        }
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE debate_sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, next.as_str(), now_ms()],
        )?;
        drop(conn);
        Ok(DebateSession {
            status: next,
            ..session
        })
    }

    pub async fn set_debate_round(&self, id: &str, round: u32) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE debate_sessions SET current_round = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, round as i64, now_ms()],
        )?;
        Ok(())
    }

    pub async fn set_debate_outcome(
        &self,
        id: &str,
        final_decisions: &[TradeDecision],
        primary: &TradeDecision,
    ) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE debate_sessions SET final_decisions = ?2, primary_decision = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                serde_json::to_string(final_decisions)?,
                serde_json::to_string(primary)?,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub async fn set_debate_executed(&self, id: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE debate_sessions SET executed = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    pub async fn add_debate_participant(
        &self,
        mut participant: DebateParticipant,
    ) -> Result<DebateParticipant> {
        if participant.id.is_empty() {
            participant.id = new_id();
        }
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO debate_participants (id, session_id, model_config_id, name, personality, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &participant.id,
                &participant.session_id,
                &participant.model_config_id,
                &participant.name,
                participant.personality.as_str(),
                participant.sort_order as i64
            ],
        )?;
        Ok(participant)
    }

    pub async fn list_debate_participants(
        &self,
        session_id: &str,
    ) -> Result<Vec<DebateParticipant>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, model_config_id, name, personality, sort_order
             FROM debate_participants WHERE session_id = ?1 ORDER BY sort_order ASC",
        )?;
        let out = stmt
            .query_map(params![session_id], |row| {
                let personality_raw: String = row.get(4)?;
                Ok(DebateParticipant {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    model_config_id: row.get(2)?,
                    name: row.get(3)?,
                    personality: Personality::parse(&personality_raw)
                        .unwrap_or(Personality::Analyst),
                    sort_order: row.get::<_, i64>(5)?.max(0) as u32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub async fn insert_debate_message(&self, mut msg: DebateMessage) -> Result<DebateMessage> {
        if msg.id.is_empty() {
            msg.id = new_id();
        }
        if msg.created_at == 0 {
            msg.created_at = now_ms();
        }
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO debate_messages (id, session_id, round, participant_id, author,
             personality, message_type, content, decisions, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &msg.id,
                &msg.session_id,
                msg.round as i64,
                &msg.participant_id,
                &msg.author,
                msg.personality.as_str(),
                &msg.message_type,
                &msg.content,
                serde_json::to_string(&msg.decisions)?,
                msg.confidence,
                msg.created_at
            ],
        )?;
        Ok(msg)
    }

    /// Messages in debate order: `(round, created_at)` ascending.
    pub async fn list_debate_messages(&self, session_id: &str) -> Result<Vec<DebateMessage>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, round, participant_id, author, personality, message_type,
             content, decisions, confidence, created_at
             FROM debate_messages WHERE session_id = ?1 ORDER BY round ASC, created_at ASC",
        )?;
        let out = stmt
            .query_map(params![session_id], |row| {
                let personality_raw: String = row.get(5)?;
                let decisions_raw: String = row.get(8)?;
                Ok(DebateMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    round: row.get::<_, i64>(2)?.max(0) as u32,
                    participant_id: row.get(3)?,
                    author: row.get(4)?,
                    personality: Personality::parse(&personality_raw)
                        .unwrap_or(Personality::Analyst),
                    message_type: row.get(6)?,
                    content: row.get(7)?,
                    decisions: serde_json::from_str(&decisions_raw).unwrap_or_default(),
                    confidence: row.get(9)?,
                    created_at: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    /// One vote per participant; a second insert for the same participant is
    /// rejected by the unique key.
    pub async fn insert_debate_vote(&self, mut vote: DebateVote) -> Result<DebateVote> {
        if vote.id.is_empty() {
            vote.id = new_id();
        }
        if vote.created_at == 0 {
            vote.created_at = now_ms();
        }
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO debate_votes (id, session_id, participant_id, author, decisions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &vote.id,
                &vote.session_id,
                &vote.participant_id,
                &vote.author,
                serde_json::to_string(&vote.decisions)?,
                vote.created_at
            ],
        )?;
        Ok(vote)
    }

    pub async fn list_debate_votes(&self, session_id: &str) -> Result<Vec<DebateVote>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, participant_id, author, decisions, created_at
             FROM debate_votes WHERE session_id = ?1 ORDER BY created_at ASC",
        )?;
        let out = stmt
            .query_map(params![session_id], |row| {
                let decisions_raw: String = row.get(4)?;
                Ok(DebateVote {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    participant_id: row.get(2)?,
                    author: row.get(3)?,
                    decisions: serde_json::from_str(&decisions_raw).unwrap_or_default(),
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }
}

/// Startup sweep: anything left `running` or `voting` by a previous process
/// is dead; mark it cancelled so the engine never resumes a half-finished
/// debate.
pub fn cancel_stale_sessions(conn: &Connection) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE debate_sessions SET status = 'cancelled', updated_at = ?1
         WHERE status IN ('running', 'voting')",
        params![now_ms()],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_session() -> DebateSession {
        DebateSession {
            id: String::new(),
            user_id: "u1".to_string(),
            name: "btc-debate".to_string(),
            strategy_id: "s1".to_string(),
            status: DebateStatus::Pending,
            symbol: Some("BTCUSDT".to_string()),
            max_rounds: 3,
            current_round: 0,
            interval_minutes: 0,
            prompt_variant: PromptVariant::Balanced,
            auto_execute: false,
            trader_id: None,
            oi_ranking_top_n: 0,
            oi_ranking_duration: String::new(),
            final_decisions: Vec::new(),
            primary_decision: None,
            executed: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn status_machine_is_forward_only() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_debate_session(sample_session()).await.unwrap();

        store
            .transition_debate_status(&s.id, DebateStatus::Running)
            .await
            .unwrap();
        // pending again is illegal
        assert!(store
            .transition_debate_status(&s.id, DebateStatus::Running)
            .await
            .is_err());
        store
            .transition_debate_status(&s.id, DebateStatus::Voting)
            .await
            .unwrap();
        store
            .transition_debate_status(&s.id, DebateStatus::Completed)
            .await
            .unwrap();
        // completed is terminal
        assert!(store
            .transition_debate_status(&s.id, DebateStatus::Cancelled)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stale_sessions_cancelled() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_debate_session(sample_session()).await.unwrap();
        store
            .transition_debate_status(&s.id, DebateStatus::Running)
            .await
            .unwrap();

        {
            let conn = store.conn().lock().await;
            assert_eq!(cancel_stale_sessions(&conn).unwrap(), 1);
        }
        let reloaded = store.get_debate_session(&s.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DebateStatus::Cancelled);
    }

    #[tokio::test]
    async fn one_vote_per_participant() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_debate_session(sample_session()).await.unwrap();
        let vote = DebateVote {
            id: String::new(),
            session_id: s.id.clone(),
            participant_id: "p1".to_string(),
            author: "gpt".to_string(),
            decisions: Vec::new(),
            created_at: 0,
        };
        store.insert_debate_vote(vote.clone()).await.unwrap();
        assert!(store.insert_debate_vote(vote).await.is_err());
    }
}
