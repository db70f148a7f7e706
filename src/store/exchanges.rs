use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{new_id, now_ms, Store};
use crate::models::Venue;

/// One venue account. `credentials` holds base64-wrapped ciphertext of the
/// venue-specific credential blob (key/secret/passphrase/wallet, depending on
/// venue); the store never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub id: String,
    pub user_id: String,
    pub exchange_type: String,
    pub label: String,
    pub enabled: bool,
    pub testnet: bool,
    #[serde(skip_serializing)]
    pub credentials: String,
    pub created_at: i64,
}

impl ExchangeAccount {
    pub fn venue(&self) -> Option<Venue> {
        Venue::parse(&self.exchange_type)
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExchangeAccount> {
    Ok(ExchangeAccount {
        id: row.get(0)?,
        user_id: row.get(1)?,
        exchange_type: row.get(2)?,
        label: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        testnet: row.get::<_, i64>(5)? != 0,
        credentials: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const COLUMNS: &str = "id, user_id, exchange_type, label, enabled, testnet, credentials, created_at";

impl Store {
    pub async fn create_exchange_account(&self, mut acc: ExchangeAccount) -> Result<ExchangeAccount> {
        if Venue::parse(&acc.exchange_type).is_none() {
            return Err(anyhow!("unknown venue {:?}", acc.exchange_type));
        }
        if acc.id.is_empty() {
            acc.id = new_id();
        }
        acc.created_at = now_ms();

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO exchange_accounts (id, user_id, exchange_type, label, enabled, testnet, credentials, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &acc.id,
                &acc.user_id,
                &acc.exchange_type,
                &acc.label,
                acc.enabled as i64,
                acc.testnet as i64,
                &acc.credentials,
                acc.created_at
            ],
        )?;
        Ok(acc)
    }

    pub async fn get_exchange_account(&self, id: &str) -> Result<Option<ExchangeAccount>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM exchange_accounts WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_account(row)?))
    }

    pub async fn list_exchange_accounts(&self, user_id: &str) -> Result<Vec<ExchangeAccount>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM exchange_accounts WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let out = stmt
            .query_map(params![user_id], row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub async fn update_exchange_account(&self, acc: &ExchangeAccount) -> Result<()> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE exchange_accounts SET label = ?2, enabled = ?3, testnet = ?4, credentials = ?5
             WHERE id = ?1",
            params![
                &acc.id,
                &acc.label,
                acc.enabled as i64,
                acc.testnet as i64,
                &acc.credentials
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("exchange account {} not found", acc.id));
        }
        Ok(())
    }

    pub async fn delete_exchange_account(&self, id: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute("DELETE FROM exchange_accounts WHERE id = ?1", params![id])?;
        Ok(())
    }
}

/// First-run migration: early releases keyed exchange accounts by the venue
/// tag itself ("binance", "bybit", ...). Rewrite any such row to a UUID id
/// with `exchange_type` set to the prior id, and repoint every trader that
/// referenced it, all inside one transaction. No-op when nothing matches.
pub fn migrate_legacy_exchange_ids(conn: &mut Connection) -> Result<usize> {
    let legacy: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM exchange_accounts WHERE id IN
             ('binance','bybit','okx','bitget','hyperliquid','aster','lighter','gateio')",
        )?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    if legacy.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    for old_id in &legacy {
        let new_id = Uuid::new_v4().to_string();
        tx.execute(
            "UPDATE exchange_accounts SET id = ?1, exchange_type = ?2 WHERE id = ?2",
            params![&new_id, old_id],
        )?;
        tx.execute(
            "UPDATE traders SET exchange_account_id = ?1 WHERE exchange_account_id = ?2",
            params![&new_id, old_id],
        )?;
    }
    tx.commit()?;
    Ok(legacy.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE exchange_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                exchange_type TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                testnet INTEGER NOT NULL DEFAULT 0,
                credentials TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );
            CREATE TABLE traders (
                id TEXT PRIMARY KEY,
                exchange_account_id TEXT NOT NULL
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn legacy_ids_become_uuids_and_traders_follow() {
        let mut conn = legacy_db();
        for venue in ["binance", "bybit", "hyperliquid"] {
            conn.execute(
                "INSERT INTO exchange_accounts (id, user_id, exchange_type, created_at)
                 VALUES (?1, 'u1', ?1, 0)",
                params![venue],
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO traders (id, exchange_account_id) VALUES ('t1', 'binance')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO traders (id, exchange_account_id) VALUES ('t2', 'bybit')",
            [],
        )
        .unwrap();

        let migrated = migrate_legacy_exchange_ids(&mut conn).unwrap();
        assert_eq!(migrated, 3);

        let rows: Vec<(String, String)> = {
            let mut stmt = conn
                .prepare("SELECT id, exchange_type FROM exchange_accounts ORDER BY exchange_type")
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .collect::<std::result::Result<Vec<_>, _>>()
                .unwrap()
        };
        for (id, exchange_type) in &rows {
            assert!(Uuid::parse_str(id).is_ok(), "id {id} is not a uuid");
            assert!(Venue::parse(exchange_type).is_some());
        }

        // Every trader now points at an existing account row.
        let orphans: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM traders t
                 LEFT JOIN exchange_accounts e ON e.id = t.exchange_account_id
                 WHERE e.id IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn migration_is_noop_on_clean_db() {
        let mut conn = legacy_db();
        conn.execute(
            "INSERT INTO exchange_accounts (id, user_id, exchange_type, created_at)
             VALUES ('7f2b1a9e-0000-0000-0000-000000000001', 'u1', 'binance', 0)",
            [],
        )
        .unwrap();
        assert_eq!(migrate_legacy_exchange_ids(&mut conn).unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_venue_rejected() {
        let store = Store::open_in_memory().unwrap();
        let acc = ExchangeAccount {
            id: String::new(),
            user_id: "u1".to_string(),
            exchange_type: "ftx".to_string(),
            label: String::new(),
            enabled: true,
            testnet: false,
            credentials: String::new(),
            created_at: 0,
        };
        assert!(store.create_exchange_account(acc).await.is_err());
    }
}
