use anyhow::{anyhow, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, Store};
use crate::models::{PositionSide, PositionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub trader_id: String,
    pub exchange_id: String,
    pub venue: String,
    /// Venue-assigned position id when known; empty otherwise.
    pub exchange_position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    /// Total quantity ever opened into this position.
    pub entry_qty: f64,
    /// Quantity still open; `qty <= entry_qty`.
    pub qty: f64,
    pub entry_price: f64,
    pub entry_order_id: String,
    pub entry_time: i64,
    /// Weighted average over the closed portion; 0 until the first close.
    pub exit_price: f64,
    pub exit_order_id: String,
    /// Non-zero iff status is CLOSED.
    pub exit_time: i64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub leverage: u32,
    pub status: PositionStatus,
    pub close_reason: String,
    /// "system" for positions our own orders opened, "sync" for ones first
    /// seen through exchange fills.
    pub source: String,
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let side_raw: String = row.get(6)?;
    let status_raw: String = row.get(17)?;
    Ok(Position {
        id: row.get(0)?,
        trader_id: row.get(1)?,
        exchange_id: row.get(2)?,
        venue: row.get(3)?,
        exchange_position_id: row.get(4)?,
        symbol: row.get(5)?,
        side: PositionSide::parse(&side_raw).unwrap_or(PositionSide::Long),
        entry_qty: row.get(7)?,
        qty: row.get(8)?,
        entry_price: row.get(9)?,
        entry_order_id: row.get(10)?,
        entry_time: row.get(11)?,
        exit_price: row.get(12)?,
        exit_order_id: row.get(13)?,
        exit_time: row.get(14)?,
        realized_pnl: row.get(15)?,
        fee: row.get(16)?,
        status: PositionStatus::parse(&status_raw).unwrap_or(PositionStatus::Open),
        close_reason: row.get(18)?,
        source: row.get(19)?,
        leverage: row.get::<_, i64>(20)?.max(1) as u32,
    })
}

const COLUMNS: &str = "id, trader_id, exchange_id, venue, exchange_position_id, symbol, side,
    entry_qty, qty, entry_price, entry_order_id, entry_time, exit_price, exit_order_id, exit_time,
    realized_pnl, fee, status, close_reason, source, leverage";

impl Store {
    pub async fn insert_position(&self, mut pos: Position) -> Result<Position> {
        if pos.id.is_empty() {
            pos.id = new_id();
        }
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO positions (id, trader_id, exchange_id, venue, exchange_position_id, symbol,
             side, entry_qty, qty, entry_price, entry_order_id, entry_time, exit_price,
             exit_order_id, exit_time, realized_pnl, fee, status, close_reason, source, leverage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                &pos.id,
                &pos.trader_id,
                &pos.exchange_id,
                &pos.venue,
                &pos.exchange_position_id,
                &pos.symbol,
                pos.side.as_str(),
                pos.entry_qty,
                pos.qty,
                pos.entry_price,
                &pos.entry_order_id,
                pos.entry_time,
                pos.exit_price,
                &pos.exit_order_id,
                pos.exit_time,
                pos.realized_pnl,
                pos.fee,
                pos.status.as_str(),
                &pos.close_reason,
                &pos.source,
                pos.leverage as i64
            ],
        )?;
        Ok(pos)
    }

    /// Insert a CLOSED position imported from an exchange's closed-PnL
    /// history. Deduplicated on `(exchange_id, exchange_position_id)`;
    /// returns false when the row already existed.
    pub async fn insert_position_if_absent(&self, mut pos: Position) -> Result<bool> {
        if pos.exchange_position_id.is_empty() {
            return Err(anyhow!("imported position requires exchange_position_id"));
        }
        if pos.id.is_empty() {
            pos.id = new_id();
        }
        let conn = self.conn().lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO positions (id, trader_id, exchange_id, venue,
             exchange_position_id, symbol, side, entry_qty, qty, entry_price, entry_order_id,
             entry_time, exit_price, exit_order_id, exit_time, realized_pnl, fee, status,
             close_reason, source, leverage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                &pos.id,
                &pos.trader_id,
                &pos.exchange_id,
                &pos.venue,
                &pos.exchange_position_id,
                &pos.symbol,
                pos.side.as_str(),
                pos.entry_qty,
                pos.qty,
                pos.entry_price,
                &pos.entry_order_id,
                pos.entry_time,
                pos.exit_price,
                &pos.exit_order_id,
                pos.exit_time,
                pos.realized_pnl,
                pos.fee,
                pos.status.as_str(),
                &pos.close_reason,
                &pos.source,
                pos.leverage as i64
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {COLUMNS} FROM positions WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_position(row)?))
    }

    /// The at-most-one OPEN row for `(trader, symbol, side)`.
    pub async fn find_open_position(
        &self,
        trader_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM positions
             WHERE trader_id = ?1 AND symbol = ?2 AND side = ?3 AND status = 'OPEN'"
        ))?;
        let mut rows = stmt.query(params![trader_id, symbol, side.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_position(row)?))
    }

    pub async fn update_position(&self, pos: &Position) -> Result<()> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE positions SET entry_qty = ?2, qty = ?3, entry_price = ?4, exit_price = ?5,
             exit_order_id = ?6, exit_time = ?7, realized_pnl = ?8, fee = ?9, status = ?10,
             close_reason = ?11, leverage = ?12, exchange_position_id = ?13
             WHERE id = ?1",
            params![
                &pos.id,
                pos.entry_qty,
                pos.qty,
                pos.entry_price,
                pos.exit_price,
                &pos.exit_order_id,
                pos.exit_time,
                pos.realized_pnl,
                pos.fee,
                pos.status.as_str(),
                &pos.close_reason,
                pos.leverage as i64,
                &pos.exchange_position_id
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("position {} not found", pos.id));
        }
        Ok(())
    }

    pub async fn list_open_positions(&self, trader_id: &str) -> Result<Vec<Position>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM positions
             WHERE trader_id = ?1 AND status = 'OPEN' ORDER BY entry_time ASC"
        ))?;
        let out = stmt
            .query_map(params![trader_id], row_to_position)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub async fn count_open_positions(&self, trader_id: &str) -> Result<usize> {
        let conn = self.conn().lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE trader_id = ?1 AND status = 'OPEN'",
            params![trader_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub async fn list_positions(&self, trader_id: &str, limit: usize) -> Result<Vec<Position>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM positions
             WHERE trader_id = ?1 ORDER BY entry_time DESC LIMIT ?2"
        ))?;
        let out = stmt
            .query_map(params![trader_id, limit], row_to_position)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }
}
