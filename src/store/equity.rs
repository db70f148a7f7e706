use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::Store;

/// Append-only equity curve, one row per completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub trader_id: String,
    pub created_at: i64,
    pub total_equity: f64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
}

impl Store {
    pub async fn insert_equity_snapshot(&self, snap: &EquitySnapshot) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO equity_snapshots (trader_id, created_at, total_equity, balance,
             unrealized_pnl, position_count, margin_used_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &snap.trader_id,
                snap.created_at,
                snap.total_equity,
                snap.balance,
                snap.unrealized_pnl,
                snap.position_count as i64,
                snap.margin_used_pct
            ],
        )?;
        Ok(())
    }

    pub async fn list_equity_snapshots(
        &self,
        trader_id: &str,
        since: i64,
        limit: usize,
    ) -> Result<Vec<EquitySnapshot>> {
        let limit = limit.clamp(1, 20_000) as i64;
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trader_id, created_at, total_equity, balance, unrealized_pnl, position_count,
             margin_used_pct
             FROM equity_snapshots WHERE trader_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC LIMIT ?3",
        )?;
        let out = stmt
            .query_map(params![trader_id, since, limit], |row| {
                Ok(EquitySnapshot {
                    trader_id: row.get(0)?,
                    created_at: row.get(1)?,
                    total_equity: row.get(2)?,
                    balance: row.get(3)?,
                    unrealized_pnl: row.get(4)?,
                    position_count: row.get::<_, i64>(5)?.max(0) as usize,
                    margin_used_pct: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_range() {
        let store = Store::open_in_memory().unwrap();
        for (ts, equity) in [(100, 1000.0), (200, 1010.0), (300, 990.0)] {
            store
                .insert_equity_snapshot(&EquitySnapshot {
                    trader_id: "t1".to_string(),
                    created_at: ts,
                    total_equity: equity,
                    balance: equity,
                    unrealized_pnl: 0.0,
                    position_count: 0,
                    margin_used_pct: 0.0,
                })
                .await
                .unwrap();
        }
        let rows = store.list_equity_snapshots("t1", 150, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].created_at, 200);
    }
}
