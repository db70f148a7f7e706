//! Full debate round-trip with scripted models: event ordering, persisted
//! message monotonicity, weighted consensus, stale-run recovery, and
//! consensus execution through a trader runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use fleetbot_backend::config::AppConfig;
use fleetbot_backend::debate::{execute_consensus, DebateEngine, DebateEvent};
use fleetbot_backend::decision::engine::CycleDeps;
use fleetbot_backend::exchange::{ExchangeAdapter, PaperExchange};
use fleetbot_backend::llm::{ChatCallRequest, ModelClient};
use fleetbot_backend::market::{ContextBuilder, Kline, MarketDataProvider, StaticMarketProvider};
use fleetbot_backend::models::{PositionSide, TradeAction, Venue};
use fleetbot_backend::reconcile::Reconciler;
use fleetbot_backend::store::{
    DebateParticipant, DebateSession, DebateStatus, ModelConfig, Personality, Store, Strategy,
    StrategyConfig, Trader,
};
use fleetbot_backend::trader::TraderRuntime;

struct ScriptedClient {
    name: String,
    response: String,
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn call_request(&self, _req: &ChatCallRequest) -> Result<String> {
        Ok(self.response.clone())
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

fn scripted_response(action: &str, confidence: u32) -> String {
    format!(
        "<reasoning>scripted argument</reasoning>\n\
         <decision>[{{\"symbol\": \"BTCUSDT\", \"action\": \"{action}\", \"confidence\": {confidence}, \
         \"leverage\": 5, \"position_pct\": 0.2, \"stop_loss\": 0.03, \"take_profit\": 0.06}}]</decision>\n\
         <final_vote>[{{\"symbol\": \"BTCUSDT\", \"action\": \"{action}\", \"confidence\": {confidence}}}]</final_vote>"
    )
}

fn provider_with_btc() -> Arc<StaticMarketProvider> {
    let provider = Arc::new(StaticMarketProvider::new());
    provider.set_price("BTCUSDT", 50_000.0);
    let klines: Vec<Kline> = (0..60)
        .map(|i| Kline {
            open_time: i * 60_000,
            close_time: (i + 1) * 60_000,
            open: 50_000.0,
            high: 50_100.0,
            low: 49_900.0,
            close: 50_000.0 + (i % 5) as f64,
            volume: 10.0,
            quote_volume: 500_000.0,
            trade_count: 100,
        })
        .collect();
    for interval in ["15m", "1h", "4h"] {
        provider.set_klines("BTCUSDT", interval, klines.clone());
    }
    provider
}

fn strategy_with_btc() -> Strategy {
    let mut config = StrategyConfig::default();
    config.coin_source.static_coins = vec!["BTCUSDT".to_string()];
    Strategy {
        id: String::new(),
        user_id: "u1".to_string(),
        name: "debate-strategy".to_string(),
        is_default: false,
        is_public: false,
        config_visible: false,
        config,
        created_at: 0,
        updated_at: 0,
    }
}

async fn seed_session(store: &Store, max_rounds: u32) -> (DebateSession, Vec<DebateParticipant>) {
    let strategy = store.create_strategy(strategy_with_btc()).await.unwrap();

    let mut participants = Vec::new();
    let specs = [
        ("bull-model", Personality::Bull),
        ("analyst-model", Personality::Analyst),
        ("bear-model", Personality::Bear),
    ];
    let session = store
        .create_debate_session(DebateSession {
            id: String::new(),
            user_id: "u1".to_string(),
            name: "btc-debate".to_string(),
            strategy_id: strategy.id.clone(),
            status: DebateStatus::Pending,
            symbol: Some("BTCUSDT".to_string()),
            max_rounds,
            current_round: 0,
            interval_minutes: 0,
            prompt_variant: Default::default(),
            auto_execute: false,
            trader_id: None,
            oi_ranking_top_n: 0,
            oi_ranking_duration: String::new(),
            final_decisions: Vec::new(),
            primary_decision: None,
            executed: false,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();

    for (order, (name, personality)) in specs.iter().enumerate() {
        let model_cfg = store
            .create_model_config(ModelConfig {
                id: String::new(),
                user_id: "u1".to_string(),
                provider: "openai".to_string(),
                model_name: Some(name.to_string()),
                enabled: true,
                api_key: String::new(),
                base_url: None,
                created_at: 0,
            })
            .await
            .unwrap();
        let participant = store
            .add_debate_participant(DebateParticipant {
                id: String::new(),
                session_id: session.id.clone(),
                model_config_id: model_cfg.id,
                name: name.to_string(),
                personality: *personality,
                sort_order: order as u32,
            })
            .await
            .unwrap();
        participants.push(participant);
    }

    (session, participants)
}

fn engine_with_scripts(
    store: Store,
    provider: Arc<StaticMarketProvider>,
) -> Arc<DebateEngine> {
    // Responses keyed by the model-name override each participant carries.
    let mut scripts: HashMap<String, String> = HashMap::new();
    scripts.insert("bull-model".into(), scripted_response("open_long", 80));
    scripts.insert("analyst-model".into(), scripted_response("open_long", 40));
    scripts.insert("bear-model".into(), scripted_response("open_short", 70));

    DebateEngine::with_client_factory(
        store,
        provider as Arc<dyn MarketDataProvider>,
        AppConfig::default(),
        Box::new(move |cfg: &ModelConfig| {
            let name = cfg.model_name.clone().unwrap_or_default();
            let response = scripts
                .get(&name)
                .cloned()
                .unwrap_or_else(|| scripted_response("wait", 50));
            Ok(Arc::new(ScriptedClient { name, response }) as Arc<dyn ModelClient>)
        }),
    )
}

#[tokio::test]
async fn debate_runs_to_weighted_consensus() {
    let store = Store::open_in_memory().unwrap();
    let (session, participants) = seed_session(&store, 2).await;
    let engine = engine_with_scripts(store.clone(), provider_with_btc());

    let mut events = engine.subscribe(&session.id);
    let handle = engine.start_debate(&session.id).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("debate stalled")
            .expect("event channel closed early");
        let done = matches!(event, DebateEvent::Consensus(_));
        seen.push(event);
        if done {
            break;
        }
    }
    handle.await.unwrap();

    // Rounds in order, messages inside rounds, votes after all messages,
    // consensus exactly once.
    let mut last_round_started = 0;
    let mut messages_seen = 0;
    let mut votes_seen = 0;
    let mut consensus_seen = 0;
    for event in &seen {
        match event {
            DebateEvent::RoundStart(r) => {
                assert_eq!(*r, last_round_started + 1);
                last_round_started = *r;
            }
            DebateEvent::Message(m) => {
                assert_eq!(m.round, last_round_started);
                assert_eq!(votes_seen, 0, "message after voting began");
                messages_seen += 1;
            }
            DebateEvent::Vote(_) => votes_seen += 1,
            DebateEvent::Consensus(_) => consensus_seen += 1,
            _ => {}
        }
    }
    assert_eq!(messages_seen, participants.len() * 2);
    assert_eq!(votes_seen, participants.len());
    assert_eq!(consensus_seen, 1);

    // Weighted scores: open_long 0.8 + 0.5 (40 floors) vs open_short 0.7.
    let DebateEvent::Consensus(primary) = seen.last().unwrap() else {
        panic!("last event must be consensus");
    };
    assert_eq!(primary.symbol, "BTCUSDT");
    assert_eq!(primary.action, TradeAction::OpenLong);
    assert_eq!(primary.confidence, 60.0);

    // Persisted state agrees with the stream.
    let reloaded = store.get_debate_session(&session.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, DebateStatus::Completed);
    assert_eq!(
        reloaded.primary_decision.as_ref().unwrap().action,
        TradeAction::OpenLong
    );

    let messages = store.list_debate_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), participants.len() * 2);
    let mut prev_round = 0;
    for msg in &messages {
        assert!(msg.round >= prev_round, "rounds must be non-decreasing");
        prev_round = msg.round;
    }
    assert_eq!(messages[0].message_type, "analysis");
    assert_eq!(messages.last().unwrap().message_type, "final");

    let votes = store.list_debate_votes(&session.id).await.unwrap();
    assert_eq!(votes.len(), participants.len());
    let last_message_at = messages.iter().map(|m| m.created_at).max().unwrap();
    for vote in &votes {
        assert!(vote.created_at >= last_message_at);
    }
}

#[tokio::test]
async fn stale_running_session_is_cancelled_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("debate.db");
    let db_path = db_path.to_str().unwrap();

    let session_id = {
        let store = Store::open(db_path).unwrap();
        let (session, _) = seed_session(&store, 2).await;
        store
            .transition_debate_status(&session.id, DebateStatus::Running)
            .await
            .unwrap();
        session.id
    };

    // Simulated restart: open runs the stale-run sweep.
    let store = Store::open(db_path).unwrap();
    let session = store.get_debate_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, DebateStatus::Cancelled);

    // And the engine refuses to start a cancelled session.
    let engine = engine_with_scripts(store.clone(), provider_with_btc());
    assert!(engine.start_debate(&session_id).await.is_err());
}

#[tokio::test]
async fn too_few_participants_rejected() {
    let store = Store::open_in_memory().unwrap();
    let strategy = store.create_strategy(strategy_with_btc()).await.unwrap();
    let session = store
        .create_debate_session(DebateSession {
            id: String::new(),
            user_id: "u1".to_string(),
            name: "lonely".to_string(),
            strategy_id: strategy.id,
            status: DebateStatus::Pending,
            symbol: None,
            max_rounds: 1,
            current_round: 0,
            interval_minutes: 0,
            prompt_variant: Default::default(),
            auto_execute: false,
            trader_id: None,
            oi_ranking_top_n: 0,
            oi_ranking_duration: String::new(),
            final_decisions: Vec::new(),
            primary_decision: None,
            executed: false,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();

    let engine = engine_with_scripts(store.clone(), provider_with_btc());
    assert!(engine.start_debate(&session.id).await.is_err());
}

#[tokio::test]
async fn consensus_executes_once_through_trader_path() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, 1).await;
    let provider = provider_with_btc();
    let engine = engine_with_scripts(store.clone(), provider.clone());

    let handle = engine.start_debate(&session.id).await.unwrap();
    handle.await.unwrap();
    let completed = store.get_debate_session(&session.id).await.unwrap().unwrap();
    assert_eq!(completed.status, DebateStatus::Completed);

    // A runtime wired to a paper venue executes the primary decision.
    let paper = Arc::new(PaperExchange::new(Venue::Binance, 1_000.0));
    paper.set_mark_price("BTCUSDT", 50_000.0);
    let trader = Trader {
        id: "t-exec".to_string(),
        user_id: "u1".to_string(),
        name: "executor".to_string(),
        model_config_id: "m1".to_string(),
        exchange_account_id: "e-exec".to_string(),
        strategy_id: "s1".to_string(),
        scan_interval_min: 60,
        initial_balance: 1_000.0,
        cross_margin: true,
        show_in_competition: false,
        is_running: false,
        created_at: 0,
    };
    let deps = CycleDeps {
        store: store.clone(),
        context: Arc::new(ContextBuilder::new(
            provider as Arc<dyn MarketDataProvider>,
            30,
        )),
        client: Arc::new(ScriptedClient {
            name: "unused".to_string(),
            response: String::new(),
        }),
        adapter: paper.clone() as Arc<dyn ExchangeAdapter>,
        reconciler: Reconciler::new(store.clone()),
        model_timeout: Duration::from_secs(5),
    };
    let runtime = TraderRuntime::new(trader, StrategyConfig::default(), deps);

    let log = execute_consensus(&store, &session.id, &runtime).await.unwrap();
    assert!(!log.is_empty());

    let pos = store
        .find_open_position("t-exec", "BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .expect("consensus opened a position");
    assert!(pos.qty > 0.0);

    // Exactly-once execution.
    let again = execute_consensus(&store, &session.id, &runtime).await;
    assert!(again.is_err());
}
