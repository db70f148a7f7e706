//! Sqlite-backed persistence.
//!
//! One `Store` handle owns the connection; the per-entity repositories are
//! `impl Store` blocks in the sibling modules. Startup runs the legacy-schema
//! migrations and the stale-debate sweep before anything else touches the
//! database.

pub mod debates;
pub mod decisions;
pub mod equity;
pub mod exchanges;
pub mod model_configs;
pub mod orders;
pub mod positions;
pub mod strategies;
pub mod traders;
pub mod users;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub use debates::{
    DebateMessage, DebateParticipant, DebateSession, DebateStatus, DebateVote, Personality,
};
pub use decisions::DecisionRecord;
pub use equity::EquitySnapshot;
pub use exchanges::ExchangeAccount;
pub use model_configs::ModelConfig;
pub use orders::{FillRecord, OrderRecord};
pub use positions::Position;
pub use strategies::{
    CoinSource, CoinSourceMode, IndicatorConfig, PromptSections, RankingConfig, RankingWindow,
    RiskConfig, Strategy, StrategyConfig,
};
pub use traders::Trader;
pub use users::User;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database, apply schema and startup migrations.
    pub fn open(db_path: &str) -> Result<Self> {
        let mut conn = Connection::open(db_path).context("open sqlite database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        create_schema(&conn)?;
        run_startup_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        create_schema(&conn)?;
        run_startup_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS model_configs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            model_name TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            api_key TEXT NOT NULL DEFAULT '',
            base_url TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_model_configs_user ON model_configs(user_id);

        CREATE TABLE IF NOT EXISTS exchange_accounts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            exchange_type TEXT NOT NULL,
            label TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            testnet INTEGER NOT NULL DEFAULT 0,
            credentials TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            UNIQUE(user_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_exchange_accounts_user ON exchange_accounts(user_id);

        CREATE TABLE IF NOT EXISTS strategies (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_public INTEGER NOT NULL DEFAULT 0,
            config_visible INTEGER NOT NULL DEFAULT 0,
            config TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_strategies_user ON strategies(user_id);

        CREATE TABLE IF NOT EXISTS traders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            model_config_id TEXT NOT NULL,
            exchange_account_id TEXT NOT NULL,
            strategy_id TEXT NOT NULL,
            scan_interval_min INTEGER NOT NULL DEFAULT 60,
            initial_balance REAL NOT NULL DEFAULT 0,
            cross_margin INTEGER NOT NULL DEFAULT 1,
            show_in_competition INTEGER NOT NULL DEFAULT 1,
            is_running INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_traders_user ON traders(user_id);

        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            trader_id TEXT NOT NULL,
            exchange_id TEXT NOT NULL,
            venue TEXT NOT NULL,
            exchange_position_id TEXT NOT NULL DEFAULT '',
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            entry_qty REAL NOT NULL,
            qty REAL NOT NULL,
            entry_price REAL NOT NULL,
            entry_order_id TEXT NOT NULL DEFAULT '',
            entry_time INTEGER NOT NULL,
            exit_price REAL NOT NULL DEFAULT 0,
            exit_order_id TEXT NOT NULL DEFAULT '',
            exit_time INTEGER NOT NULL DEFAULT 0,
            realized_pnl REAL NOT NULL DEFAULT 0,
            fee REAL NOT NULL DEFAULT 0,
            leverage INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'OPEN',
            close_reason TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL DEFAULT 'system'
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_unique
            ON positions(trader_id, symbol, side) WHERE status = 'OPEN';
        CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_exchange_pos
            ON positions(exchange_id, exchange_position_id)
            WHERE exchange_position_id != '';
        CREATE INDEX IF NOT EXISTS idx_positions_trader ON positions(trader_id, status);

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            trader_id TEXT NOT NULL,
            exchange_id TEXT NOT NULL,
            venue TEXT NOT NULL,
            exchange_order_id TEXT NOT NULL,
            client_order_id TEXT NOT NULL DEFAULT '',
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            position_side TEXT NOT NULL,
            order_type TEXT NOT NULL DEFAULT 'MARKET',
            tif TEXT NOT NULL DEFAULT 'GTC',
            qty REAL NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            stop_price REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'NEW',
            filled_qty REAL NOT NULL DEFAULT 0,
            avg_fill_price REAL NOT NULL DEFAULT 0,
            commission REAL NOT NULL DEFAULT 0,
            leverage INTEGER NOT NULL DEFAULT 1,
            reduce_only INTEGER NOT NULL DEFAULT 0,
            close_position INTEGER NOT NULL DEFAULT 0,
            price_protect INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(exchange_id, exchange_order_id)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_trader ON orders(trader_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS fills (
            id TEXT PRIMARY KEY,
            trader_id TEXT NOT NULL,
            exchange_id TEXT NOT NULL,
            venue TEXT NOT NULL,
            order_id TEXT,
            exchange_order_id TEXT NOT NULL DEFAULT '',
            exchange_trade_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            price REAL NOT NULL,
            qty REAL NOT NULL,
            quote_qty REAL NOT NULL DEFAULT 0,
            commission REAL NOT NULL DEFAULT 0,
            realized_pnl REAL NOT NULL DEFAULT 0,
            is_maker INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(exchange_id, exchange_trade_id)
        );
        CREATE INDEX IF NOT EXISTS idx_fills_trader ON fills(trader_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_fills_exchange_ts ON fills(exchange_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS decision_records (
            id TEXT PRIMARY KEY,
            trader_id TEXT NOT NULL,
            cycle_number INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            system_prompt TEXT NOT NULL DEFAULT '',
            input_prompt TEXT NOT NULL DEFAULT '',
            chain_of_thought TEXT NOT NULL DEFAULT '',
            decision_json TEXT NOT NULL DEFAULT '',
            raw_response TEXT NOT NULL DEFAULT '',
            candidate_coins TEXT NOT NULL DEFAULT '[]',
            execution_log TEXT NOT NULL DEFAULT '[]',
            decisions TEXT NOT NULL DEFAULT '[]',
            success INTEGER NOT NULL DEFAULT 0,
            error_message TEXT NOT NULL DEFAULT '',
            ai_request_duration_ms INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_trader
            ON decision_records(trader_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS equity_snapshots (
            trader_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            total_equity REAL NOT NULL,
            balance REAL NOT NULL,
            unrealized_pnl REAL NOT NULL,
            position_count INTEGER NOT NULL,
            margin_used_pct REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_equity_trader
            ON equity_snapshots(trader_id, created_at ASC);

        CREATE TABLE IF NOT EXISTS debate_sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            strategy_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            symbol TEXT,
            max_rounds INTEGER NOT NULL DEFAULT 3,
            current_round INTEGER NOT NULL DEFAULT 0,
            interval_minutes INTEGER NOT NULL DEFAULT 0,
            prompt_variant TEXT NOT NULL DEFAULT 'balanced',
            auto_execute INTEGER NOT NULL DEFAULT 0,
            trader_id TEXT,
            oi_ranking_top_n INTEGER NOT NULL DEFAULT 0,
            oi_ranking_duration TEXT NOT NULL DEFAULT '',
            final_decisions TEXT NOT NULL DEFAULT '[]',
            primary_decision TEXT NOT NULL DEFAULT '',
            executed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_debate_sessions_user ON debate_sessions(user_id);

        CREATE TABLE IF NOT EXISTS debate_participants (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            model_config_id TEXT NOT NULL,
            name TEXT NOT NULL,
            personality TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_debate_participants_session
            ON debate_participants(session_id, sort_order ASC);

        CREATE TABLE IF NOT EXISTS debate_messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            round INTEGER NOT NULL,
            participant_id TEXT NOT NULL,
            author TEXT NOT NULL,
            personality TEXT NOT NULL,
            message_type TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            decisions TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_debate_messages_session
            ON debate_messages(session_id, round ASC, created_at ASC);

        CREATE TABLE IF NOT EXISTS debate_votes (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            author TEXT NOT NULL,
            decisions TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            UNIQUE(session_id, participant_id)
        );",
    )
    .context("create schema")?;
    Ok(())
}

fn run_startup_migrations(conn: &mut Connection) -> Result<()> {
    let migrated = exchanges::migrate_legacy_exchange_ids(conn)?;
    if migrated > 0 {
        info!(rows = migrated, "migrated legacy exchange ids to uuids");
    }

    let converted = migrate_text_timestamps(conn)?;
    if converted > 0 {
        info!(rows = converted, "converted text timestamps to unix ms");
    }

    let cancelled = debates::cancel_stale_sessions(conn)?;
    if cancelled > 0 {
        info!(rows = cancelled, "cancelled stale debate sessions");
    }

    Ok(())
}

/// Older databases stored order/fill/position timestamps as RFC-3339 text.
/// Rewrite any such column value to 64-bit unix milliseconds.
fn migrate_text_timestamps(conn: &mut Connection) -> Result<usize> {
    const TARGETS: &[(&str, &[&str])] = &[
        ("orders", &["created_at", "updated_at"]),
        ("fills", &["created_at"]),
        ("positions", &["entry_time", "exit_time"]),
    ];

    let tx = conn.transaction()?;
    let mut total = 0usize;

    for (table, columns) in TARGETS {
        for column in *columns {
            let sql = format!(
                "SELECT rowid, {column} FROM {table} WHERE typeof({column}) = 'text'"
            );
            let rows: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(&sql)?;
                let mapped = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                mapped
            };

            for (rowid, text) in rows {
                let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&text) else {
                    continue;
                };
                let ms = parsed.timestamp_millis();
                tx.execute(
                    &format!("UPDATE {table} SET {column} = ?1 WHERE rowid = ?2"),
                    rusqlite::params![ms, rowid],
                )?;
                total += 1;
            }
        }
    }

    tx.commit()?;
    Ok(total)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        drop(store);
        let store = Store::open_in_memory().unwrap();
        drop(store);
    }

    #[tokio::test]
    async fn text_timestamp_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO fills (id, trader_id, exchange_id, venue, exchange_trade_id,
             symbol, side, price, qty, created_at)
             VALUES ('f1', 't1', 'e1', 'binance', 'tr1', 'BTCUSDT', 'BUY', 100.0, 1.0,
             '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();

        let converted = migrate_text_timestamps(&mut conn).unwrap();
        assert_eq!(converted, 1);

        let ms: i64 = conn
            .query_row("SELECT created_at FROM fills WHERE id = 'f1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(ms, 1_704_067_200_000);
    }
}
