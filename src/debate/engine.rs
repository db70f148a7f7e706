//! The debate state machine: `pending → running → voting → completed`, with
//! cancellation from the two active states. Participants speak sequentially
//! within a round so message order is deterministic; one failing model never
//! stops the session.

use anyhow::{anyhow, Context as _, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::{consensus, personality, DebateEvent, EventHub};
use crate::config::AppConfig;
use crate::decision::{parser, prompt};
use crate::llm::{reveal_key, ChatClient, ModelClient, RetryPolicy};
use crate::market::{ContextBuilder, MarketDataProvider, TradeContext};
use crate::models::{normalize_symbol, AccountSnapshot, TradeDecision};
use crate::store::{
    DebateMessage, DebateParticipant, DebateSession, DebateStatus, DebateVote, ModelConfig, Store,
};

const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-message cap when summarizing earlier rounds into the next prompt.
const SUMMARY_CHARS_PER_MESSAGE: usize = 600;

pub type ClientFactory =
    Box<dyn Fn(&ModelConfig) -> Result<Arc<dyn ModelClient>> + Send + Sync + 'static>;

pub struct DebateEngine {
    store: Store,
    provider: Arc<dyn MarketDataProvider>,
    cfg: AppConfig,
    hub: EventHub,
    client_factory: ClientFactory,
}

impl DebateEngine {
    pub fn new(
        store: Store,
        http: reqwest::Client,
        provider: Arc<dyn MarketDataProvider>,
        cfg: AppConfig,
    ) -> Arc<Self> {
        let retry = RetryPolicy::new(cfg.model_max_attempts, cfg.model_retry_base_delay);
        let factory: ClientFactory = Box::new(move |model_cfg: &ModelConfig| {
            Ok(Arc::new(
                ChatClient::for_provider(
                    http.clone(),
                    &model_cfg.provider,
                    &reveal_key(&model_cfg.api_key),
                    model_cfg.base_url.as_deref(),
                    model_cfg.model_name.as_deref(),
                )
                .with_retry(retry.clone())
                .with_timeout(MODEL_CALL_TIMEOUT),
            ) as Arc<dyn ModelClient>)
        });
        Self::with_client_factory(store, provider, cfg, factory)
    }

    /// Seam for tests: inject scripted model clients.
    pub fn with_client_factory(
        store: Store,
        provider: Arc<dyn MarketDataProvider>,
        cfg: AppConfig,
        client_factory: ClientFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            provider,
            cfg,
            hub: EventHub::default(),
            client_factory,
        })
    }

    pub fn subscribe(&self, session_id: &str) -> tokio::sync::broadcast::Receiver<DebateEvent> {
        self.hub.subscribe(session_id)
    }

    /// Validate and launch a session. The debate runs on its own task; a
    /// panic inside is converted into a cancellation of the session.
    pub async fn start_debate(self: Arc<Self>, session_id: &str) -> Result<JoinHandle<()>> {
        let session = self
            .store
            .get_debate_session(session_id)
            .await?
            .ok_or_else(|| anyhow!("debate session {session_id} not found"))?;
        if session.status != DebateStatus::Pending {
            return Err(anyhow!(
                "debate {} is {}, expected pending",
                session_id,
                session.status.as_str()
            ));
        }
        let participants = self.store.list_debate_participants(session_id).await?;
        if participants.len() < 2 {
            return Err(anyhow!("debate needs at least 2 participants"));
        }

        let engine = self;
        let id = session_id.to_string();
        Ok(tokio::spawn(async move {
            let run = {
                let engine = Arc::clone(&engine);
                let id = id.clone();
                tokio::spawn(async move { engine.run_debate(&id).await })
            };
            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(session = %id, error = %e, "debate failed");
                    engine.cancel_after_failure(&id).await;
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(session = %id, "debate task panicked");
                    engine.cancel_after_failure(&id).await;
                }
                Err(_) => {}
            }
        }))
    }

    /// Request cancellation. In-flight model calls finish or time out on
    /// their own; the run loop stops emitting at its next checkpoint.
    pub async fn cancel_debate(&self, session_id: &str) -> Result<()> {
        self.store
            .transition_debate_status(session_id, DebateStatus::Cancelled)
            .await?;
        self.hub
            .emit(session_id, DebateEvent::Status(DebateStatus::Cancelled));
        Ok(())
    }

    async fn cancel_after_failure(&self, session_id: &str) {
        if let Err(e) = self.cancel_debate(session_id).await {
            warn!(session = %session_id, error = %e, "could not cancel failed debate");
        }
    }

    async fn is_cancelled(&self, session_id: &str) -> bool {
        matches!(
            self.store.get_debate_session(session_id).await,
            Ok(Some(s)) if s.status == DebateStatus::Cancelled
        )
    }

    async fn run_debate(&self, session_id: &str) -> Result<()> {
        let session = self
            .store
            .get_debate_session(session_id)
            .await?
            .ok_or_else(|| anyhow!("debate session {session_id} disappeared"))?;
        let participants = self.store.list_debate_participants(session_id).await?;

        let strategy = self
            .store
            .get_strategy(&session.strategy_id)
            .await?
            .ok_or_else(|| anyhow!("strategy {} missing", session.strategy_id))?;
        let mut cfg = strategy.config;
        cfg.variant = session.prompt_variant;
        if session.oi_ranking_top_n > 0 {
            cfg.coin_source.top_n = session.oi_ranking_top_n;
            if !session.oi_ranking_duration.is_empty() {
                if let Some(w) = cfg.rankings.oi_change.as_mut() {
                    w.duration = session.oi_ranking_duration.clone();
                }
            }
        }

        // One client per participant for the session's lifetime.
        let mut clients: Vec<Arc<dyn ModelClient>> = Vec::with_capacity(participants.len());
        for p in &participants {
            let model_cfg = self
                .store
                .get_model_config(&p.model_config_id)
                .await?
                .ok_or_else(|| anyhow!("model config {} missing", p.model_config_id))?;
            clients.push((self.client_factory)(&model_cfg)?);
        }

        self.store
            .transition_debate_status(session_id, DebateStatus::Running)
            .await?;
        self.hub
            .emit(session_id, DebateEvent::Status(DebateStatus::Running));
        info!(session = %session_id, participants = participants.len(), "debate started");

        // Market context is built once for the whole debate.
        let context = self
            .build_context(&session, &cfg)
            .await
            .context("debate market context")?;
        let base_prompt = prompt::build_system_prompt(&cfg, None);
        let market_text = prompt::build_user_prompt(&context);

        let mut transcript: Vec<DebateMessage> = Vec::new();

        for round in 1..=session.max_rounds {
            if self.is_cancelled(session_id).await {
                return Ok(());
            }
            self.store.set_debate_round(session_id, round).await?;
            self.hub.emit(session_id, DebateEvent::RoundStart(round));

            for (participant, client) in participants.iter().zip(&clients) {
                if self.is_cancelled(session_id).await {
                    return Ok(());
                }
                match self
                    .speak(
                        &session, &context, &base_prompt, &market_text, &transcript, round,
                        session.max_rounds, participant, client,
                    )
                    .await
                {
                    Ok(message) => {
                        self.hub
                            .emit(session_id, DebateEvent::Message(message.clone()));
                        transcript.push(message);
                    }
                    Err(e) => {
                        warn!(
                            session = %session_id,
                            participant = %participant.name,
                            round,
                            error = %e,
                            "participant failed this round"
                        );
                        self.hub.emit(
                            session_id,
                            DebateEvent::ParticipantError {
                                participant: participant.name.clone(),
                                message: format!("{e:#}"),
                            },
                        );
                    }
                }
            }

            self.hub.emit(session_id, DebateEvent::RoundEnd(round));
        }

        if self.is_cancelled(session_id).await {
            return Ok(());
        }
        self.store
            .transition_debate_status(session_id, DebateStatus::Voting)
            .await?;
        self.hub
            .emit(session_id, DebateEvent::Status(DebateStatus::Voting));

        let mut votes: Vec<DebateVote> = Vec::new();
        for (participant, client) in participants.iter().zip(&clients) {
            if self.is_cancelled(session_id).await {
                return Ok(());
            }
            match self
                .collect_vote(&session, &transcript, &market_text, participant, client)
                .await
            {
                Ok(vote) => {
                    self.hub.emit(session_id, DebateEvent::Vote(vote.clone()));
                    votes.push(vote);
                }
                Err(e) => {
                    warn!(
                        session = %session_id,
                        participant = %participant.name,
                        error = %e,
                        "participant failed to vote"
                    );
                    self.hub.emit(
                        session_id,
                        DebateEvent::ParticipantError {
                            participant: participant.name.clone(),
                            message: format!("{e:#}"),
                        },
                    );
                }
            }
        }

        let decisions = consensus::compute_consensus(&votes);
        let primary = consensus::pick_primary(&decisions, session.symbol.as_deref()).cloned();
        if let Some(primary) = &primary {
            self.store
                .set_debate_outcome(session_id, &decisions, primary)
                .await?;
        }
        self.store
            .transition_debate_status(session_id, DebateStatus::Completed)
            .await?;
        self.hub
            .emit(session_id, DebateEvent::Status(DebateStatus::Completed));
        if let Some(primary) = primary {
            info!(
                session = %session_id,
                symbol = %primary.symbol,
                action = primary.action.as_str(),
                confidence = primary.confidence,
                "consensus reached"
            );
            self.hub.emit(session_id, DebateEvent::Consensus(primary));
        }
        self.hub.drop_session(session_id);
        Ok(())
    }

    async fn build_context(
        &self,
        session: &DebateSession,
        cfg: &crate::store::StrategyConfig,
    ) -> Result<TradeContext> {
        let mut cfg = cfg.clone();
        // A declared session symbol pins the candidate universe.
        if let Some(symbol) = &session.symbol {
            cfg.coin_source.mode = crate::store::CoinSourceMode::Static;
            cfg.coin_source.static_coins = vec![symbol.clone()];
        }
        let builder = ContextBuilder::new(Arc::clone(&self.provider), self.cfg.max_candidates);
        builder
            .build(&cfg, AccountSnapshot::default(), Vec::new(), 0, 0)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn speak(
        &self,
        session: &DebateSession,
        context: &TradeContext,
        base_prompt: &str,
        market_text: &str,
        transcript: &[DebateMessage],
        round: u32,
        max_rounds: u32,
        participant: &DebateParticipant,
        client: &Arc<dyn ModelClient>,
    ) -> Result<DebateMessage> {
        let system = format!(
            "{}\n\n{}\n\n{}",
            personality::preamble(participant.personality),
            personality::debate_rules(),
            base_prompt
        );
        let user = format!(
            "{}\n\n# Current market\n{}",
            summarize_rounds(transcript),
            market_text
        );

        let response = timeout(MODEL_CALL_TIMEOUT, client.call(&system, &user))
            .await
            .map_err(|_| anyhow!("model call exceeded {MODEL_CALL_TIMEOUT:?}"))??;

        let parsed = parser::parse_response(&response, session.symbol.as_deref());
        let decisions = self.validate_symbols(session, context, parsed.decisions);
        let confidence = decisions
            .iter()
            .map(|d| d.confidence)
            .fold(0.0f64, f64::max);

        let message_type = if round == 1 {
            "analysis"
        } else if round == max_rounds {
            "final"
        } else {
            "rebuttal"
        };

        self.store
            .insert_debate_message(DebateMessage {
                id: String::new(),
                session_id: session.id.clone(),
                round,
                participant_id: participant.id.clone(),
                author: participant.name.clone(),
                personality: participant.personality,
                message_type: message_type.to_string(),
                content: response,
                decisions,
                confidence,
                created_at: 0,
            })
            .await
    }

    /// Models hallucinate tickers. With a declared session symbol every
    /// off-list symbol is rewritten to it; otherwise off-list symbols are
    /// dropped.
    fn validate_symbols(
        &self,
        session: &DebateSession,
        context: &TradeContext,
        decisions: Vec<TradeDecision>,
    ) -> Vec<TradeDecision> {
        decisions
            .into_iter()
            .filter_map(|mut d| {
                d.symbol = normalize_symbol(&d.symbol);
                let known = context.candidates.contains(&d.symbol)
                    || session.symbol.as_deref() == Some(d.symbol.as_str());
                if known {
                    return Some(d);
                }
                match &session.symbol {
                    Some(symbol) => {
                        warn!(
                            hallucinated = %d.symbol,
                            rewritten = %symbol,
                            "off-list symbol rewritten to session symbol"
                        );
                        d.symbol = symbol.clone();
                        Some(d)
                    }
                    None => {
                        warn!(dropped = %d.symbol, "off-list symbol dropped");
                        None
                    }
                }
            })
            .collect()
    }

    async fn collect_vote(
        &self,
        session: &DebateSession,
        transcript: &[DebateMessage],
        market_text: &str,
        participant: &DebateParticipant,
        client: &Arc<dyn ModelClient>,
    ) -> Result<DebateVote> {
        let system = format!(
            "{}\n\n{}",
            personality::preamble(participant.personality),
            personality::voting_instructions()
        );
        let user = format!(
            "{}\n\n# Current market\n{}",
            summarize_rounds(transcript),
            market_text
        );

        let response = timeout(MODEL_CALL_TIMEOUT, client.call(&system, &user))
            .await
            .map_err(|_| anyhow!("model call exceeded {MODEL_CALL_TIMEOUT:?}"))??;

        let decisions = parser::parse_tagged_decisions(&response, "final_vote")
            .or_else(|| parser::parse_tagged_decisions(&response, "decision"))
            .unwrap_or_else(|| {
                parser::parse_response(&response, session.symbol.as_deref()).decisions
            });

        self.store
            .insert_debate_vote(DebateVote {
                id: String::new(),
                session_id: session.id.clone(),
                participant_id: participant.id.clone(),
                author: participant.name.clone(),
                decisions,
                created_at: 0,
            })
            .await
    }
}

/// Truncated per-message transcript of the rounds so far.
fn summarize_rounds(transcript: &[DebateMessage]) -> String {
    if transcript.is_empty() {
        return "# Debate so far\n(first round, no prior arguments)".to_string();
    }
    let mut out = String::from("# Debate so far\n");
    for msg in transcript {
        let content: String = msg.content.chars().take(SUMMARY_CHARS_PER_MESSAGE).collect();
        out.push_str(&format!(
            "[round {}] {} ({}): {}\n",
            msg.round,
            msg.author,
            msg.personality.as_str(),
            content
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_summary_truncates_each_message() {
        let long = "x".repeat(5000);
        let transcript = vec![DebateMessage {
            id: "m1".to_string(),
            session_id: "s1".to_string(),
            round: 1,
            participant_id: "p1".to_string(),
            author: "bull-model".to_string(),
            personality: crate::store::Personality::Bull,
            message_type: "analysis".to_string(),
            content: long,
            decisions: Vec::new(),
            confidence: 0.0,
            created_at: 0,
        }];
        let summary = summarize_rounds(&transcript);
        assert!(summary.len() < 1000);
        assert!(summary.contains("[round 1] bull-model (bull)"));
    }
}
