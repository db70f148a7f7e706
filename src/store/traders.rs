use anyhow::{anyhow, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, now_ms, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub model_config_id: String,
    pub exchange_account_id: String,
    pub strategy_id: String,
    pub scan_interval_min: u32,
    pub initial_balance: f64,
    pub cross_margin: bool,
    pub show_in_competition: bool,
    pub is_running: bool,
    pub created_at: i64,
}

fn row_to_trader(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trader> {
    Ok(Trader {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        model_config_id: row.get(3)?,
        exchange_account_id: row.get(4)?,
        strategy_id: row.get(5)?,
        scan_interval_min: row.get::<_, i64>(6)?.max(1) as u32,
        initial_balance: row.get(7)?,
        cross_margin: row.get::<_, i64>(8)? != 0,
        show_in_competition: row.get::<_, i64>(9)? != 0,
        is_running: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
    })
}

const COLUMNS: &str = "id, user_id, name, model_config_id, exchange_account_id, strategy_id,
    scan_interval_min, initial_balance, cross_margin, show_in_competition, is_running, created_at";

impl Store {
    pub async fn create_trader(&self, mut trader: Trader) -> Result<Trader> {
        if trader.name.trim().is_empty() {
            return Err(anyhow!("trader name required"));
        }
        if trader.strategy_id.trim().is_empty() {
            return Err(anyhow!("trader requires a strategy"));
        }
        if trader.id.is_empty() {
            trader.id = new_id();
        }
        trader.created_at = now_ms();

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO traders (id, user_id, name, model_config_id, exchange_account_id, strategy_id,
             scan_interval_min, initial_balance, cross_margin, show_in_competition, is_running, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &trader.id,
                &trader.user_id,
                &trader.name,
                &trader.model_config_id,
                &trader.exchange_account_id,
                &trader.strategy_id,
                trader.scan_interval_min as i64,
                trader.initial_balance,
                trader.cross_margin as i64,
                trader.show_in_competition as i64,
                trader.is_running as i64,
                trader.created_at
            ],
        )?;
        Ok(trader)
    }

    pub async fn get_trader(&self, id: &str) -> Result<Option<Trader>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {COLUMNS} FROM traders WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_trader(row)?))
    }

    pub async fn list_traders(&self) -> Result<Vec<Trader>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {COLUMNS} FROM traders ORDER BY created_at ASC"))?;
        let out = stmt
            .query_map([], row_to_trader)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub async fn list_traders_for_user(&self, user_id: &str) -> Result<Vec<Trader>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM traders WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let out = stmt
            .query_map(params![user_id], row_to_trader)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub async fn set_trader_running(&self, id: &str, is_running: bool) -> Result<()> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE traders SET is_running = ?2 WHERE id = ?1",
            params![id, is_running as i64],
        )?;
        if changed == 0 {
            return Err(anyhow!("trader {id} not found"));
        }
        Ok(())
    }

    pub async fn update_trader(&self, trader: &Trader) -> Result<()> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE traders SET name = ?2, model_config_id = ?3, exchange_account_id = ?4,
             strategy_id = ?5, scan_interval_min = ?6, initial_balance = ?7, cross_margin = ?8,
             show_in_competition = ?9 WHERE id = ?1",
            params![
                &trader.id,
                &trader.name,
                &trader.model_config_id,
                &trader.exchange_account_id,
                &trader.strategy_id,
                trader.scan_interval_min as i64,
                trader.initial_balance,
                trader.cross_margin as i64,
                trader.show_in_competition as i64
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("trader {} not found", trader.id));
        }
        Ok(())
    }

    pub async fn delete_trader(&self, id: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute("DELETE FROM traders WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(id: &str) -> Trader {
        Trader {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: format!("trader-{id}"),
            model_config_id: "m1".to_string(),
            exchange_account_id: "e1".to_string(),
            strategy_id: "s1".to_string(),
            scan_interval_min: 60,
            initial_balance: 1000.0,
            cross_margin: true,
            show_in_competition: true,
            is_running: false,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn running_flag_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let t = store.create_trader(sample("")).await.unwrap();
        store.set_trader_running(&t.id, true).await.unwrap();
        assert!(store.get_trader(&t.id).await.unwrap().unwrap().is_running);
        store.set_trader_running(&t.id, false).await.unwrap();
        assert!(!store.get_trader(&t.id).await.unwrap().unwrap().is_running);
    }

    #[tokio::test]
    async fn strategy_is_mandatory() {
        let store = Store::open_in_memory().unwrap();
        let mut t = sample("");
        t.strategy_id = String::new();
        assert!(store.create_trader(t).await.is_err());
    }
}
