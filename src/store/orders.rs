use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, Store};
use crate::models::PositionSide;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub trader_id: String,
    pub exchange_id: String,
    pub venue: String,
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    /// "BUY" or "SELL".
    pub side: String,
    pub position_side: PositionSide,
    pub order_type: String,
    pub tif: String,
    pub qty: f64,
    pub price: f64,
    pub stop_price: f64,
    pub status: String,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub commission: f64,
    pub leverage: u32,
    pub reduce_only: bool,
    pub close_position: bool,
    pub price_protect: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub id: String,
    pub trader_id: String,
    pub exchange_id: String,
    pub venue: String,
    pub order_id: Option<String>,
    pub exchange_order_id: String,
    pub exchange_trade_id: String,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub quote_qty: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    pub is_maker: bool,
    pub created_at: i64,
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    let position_side_raw: String = row.get(8)?;
    Ok(OrderRecord {
        id: row.get(0)?,
        trader_id: row.get(1)?,
        exchange_id: row.get(2)?,
        venue: row.get(3)?,
        exchange_order_id: row.get(4)?,
        client_order_id: row.get(5)?,
        symbol: row.get(6)?,
        side: row.get(7)?,
        position_side: PositionSide::parse(&position_side_raw).unwrap_or(PositionSide::Long),
        order_type: row.get(9)?,
        tif: row.get(10)?,
        qty: row.get(11)?,
        price: row.get(12)?,
        stop_price: row.get(13)?,
        status: row.get(14)?,
        filled_qty: row.get(15)?,
        avg_fill_price: row.get(16)?,
        commission: row.get(17)?,
        leverage: row.get::<_, i64>(18)?.max(1) as u32,
        reduce_only: row.get::<_, i64>(19)? != 0,
        close_position: row.get::<_, i64>(20)? != 0,
        price_protect: row.get::<_, i64>(21)? != 0,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn row_to_fill(row: &rusqlite::Row<'_>) -> rusqlite::Result<FillRecord> {
    Ok(FillRecord {
        id: row.get(0)?,
        trader_id: row.get(1)?,
        exchange_id: row.get(2)?,
        venue: row.get(3)?,
        order_id: row.get(4)?,
        exchange_order_id: row.get(5)?,
        exchange_trade_id: row.get(6)?,
        symbol: row.get(7)?,
        side: row.get(8)?,
        price: row.get(9)?,
        qty: row.get(10)?,
        quote_qty: row.get(11)?,
        commission: row.get(12)?,
        realized_pnl: row.get(13)?,
        is_maker: row.get::<_, i64>(14)? != 0,
        created_at: row.get(15)?,
    })
}

const ORDER_COLUMNS: &str = "id, trader_id, exchange_id, venue, exchange_order_id, client_order_id,
    symbol, side, position_side, order_type, tif, qty, price, stop_price, status, filled_qty,
    avg_fill_price, commission, leverage, reduce_only, close_position, price_protect,
    created_at, updated_at";

const FILL_COLUMNS: &str = "id, trader_id, exchange_id, venue, order_id, exchange_order_id,
    exchange_trade_id, symbol, side, price, qty, quote_qty, commission, realized_pnl, is_maker,
    created_at";

impl Store {
    /// Insert an order. Duplicate `(exchange, exchange_order_id)` submissions
    /// are absorbed; returns false when the row already existed.
    pub async fn insert_order(&self, mut order: OrderRecord) -> Result<bool> {
        if order.id.is_empty() {
            order.id = new_id();
        }
        let conn = self.conn().lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO orders (id, trader_id, exchange_id, venue, exchange_order_id,
             client_order_id, symbol, side, position_side, order_type, tif, qty, price, stop_price,
             status, filled_qty, avg_fill_price, commission, leverage, reduce_only, close_position,
             price_protect, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                &order.id,
                &order.trader_id,
                &order.exchange_id,
                &order.venue,
                &order.exchange_order_id,
                &order.client_order_id,
                &order.symbol,
                &order.side,
                order.position_side.as_str(),
                &order.order_type,
                &order.tif,
                order.qty,
                order.price,
                order.stop_price,
                &order.status,
                order.filled_qty,
                order.avg_fill_price,
                order.commission,
                order.leverage as i64,
                order.reduce_only as i64,
                order.close_position as i64,
                order.price_protect as i64,
                order.created_at,
                order.updated_at
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn update_order_status(
        &self,
        exchange_id: &str,
        exchange_order_id: &str,
        status: &str,
        filled_qty: f64,
        avg_fill_price: f64,
        updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE orders SET status = ?3, filled_qty = ?4, avg_fill_price = ?5, updated_at = ?6
             WHERE exchange_id = ?1 AND exchange_order_id = ?2",
            params![
                exchange_id,
                exchange_order_id,
                status,
                filled_qty,
                avg_fill_price,
                updated_at
            ],
        )?;
        Ok(())
    }

    pub async fn list_orders(&self, trader_id: &str, limit: usize) -> Result<Vec<OrderRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE trader_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let out = stmt
            .query_map(params![trader_id, limit], row_to_order)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    /// Insert a fill. Duplicate `(exchange, exchange_trade_id)` events are
    /// absorbed; returns false when the row already existed.
    pub async fn insert_fill(&self, mut fill: FillRecord) -> Result<bool> {
        if fill.id.is_empty() {
            fill.id = new_id();
        }
        let conn = self.conn().lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fills (id, trader_id, exchange_id, venue, order_id,
             exchange_order_id, exchange_trade_id, symbol, side, price, qty, quote_qty, commission,
             realized_pnl, is_maker, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                &fill.id,
                &fill.trader_id,
                &fill.exchange_id,
                &fill.venue,
                fill.order_id.as_deref(),
                &fill.exchange_order_id,
                &fill.exchange_trade_id,
                &fill.symbol,
                &fill.side,
                fill.price,
                fill.qty,
                fill.quote_qty,
                fill.commission,
                fill.realized_pnl,
                fill.is_maker as i64,
                fill.created_at
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn count_fills(&self, exchange_id: &str) -> Result<usize> {
        let conn = self.conn().lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE exchange_id = ?1",
            params![exchange_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Catch-up watermark: the newest fill timestamp seen for an exchange.
    pub async fn latest_fill_ts(&self, exchange_id: &str) -> Result<i64> {
        let conn = self.conn().lock().await;
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(created_at) FROM fills WHERE exchange_id = ?1",
            params![exchange_id],
            |r| r.get(0),
        )?;
        Ok(ts.unwrap_or(0))
    }

    pub async fn list_fills(&self, trader_id: &str, limit: usize) -> Result<Vec<FillRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FILL_COLUMNS} FROM fills
             WHERE trader_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let out = stmt
            .query_map(params![trader_id, limit], row_to_fill)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(trade_id: &str, ts: i64) -> FillRecord {
        FillRecord {
            id: String::new(),
            trader_id: "t1".to_string(),
            exchange_id: "e1".to_string(),
            venue: "binance".to_string(),
            order_id: None,
            exchange_order_id: "o1".to_string(),
            exchange_trade_id: trade_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            price: 100.0,
            qty: 0.5,
            quote_qty: 50.0,
            commission: 0.02,
            realized_pnl: 0.0,
            is_maker: false,
            created_at: ts,
        }
    }

    #[tokio::test]
    async fn duplicate_fills_absorbed() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.insert_fill(fill("tr-1", 1000)).await.unwrap());
        assert!(!store.insert_fill(fill("tr-1", 1000)).await.unwrap());
        assert!(store.insert_fill(fill("tr-2", 2000)).await.unwrap());
        assert_eq!(store.count_fills("e1").await.unwrap(), 2);
        assert_eq!(store.latest_fill_ts("e1").await.unwrap(), 2000);
        assert_eq!(store.latest_fill_ts("other").await.unwrap(), 0);
    }
}
