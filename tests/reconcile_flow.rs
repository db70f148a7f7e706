//! End-to-end reconciliation scenarios: averaging, partial and over-close,
//! idempotent fill ingest, and watermark catch-up against a paper venue.

use std::sync::Arc;

use fleetbot_backend::exchange::{
    ExchangeAdapter, OrderRequest, OrderSide, PaperExchange,
};
use fleetbot_backend::models::{PositionSide, PositionStatus, TradeAction, Venue};
use fleetbot_backend::reconcile::{Reconciler, TradeUpdate};
use fleetbot_backend::store::Store;

fn update(action: TradeAction, symbol: &str, qty: f64, price: f64, ts: i64) -> TradeUpdate {
    TradeUpdate {
        trader_id: "t1".to_string(),
        exchange_id: "e1".to_string(),
        venue: "binance".to_string(),
        symbol: symbol.to_string(),
        action,
        qty,
        price,
        fee: 0.0,
        realized_pnl: None,
        ts_ms: ts,
        order_id: format!("o-{ts}"),
    }
}

fn market_order(symbol: &str, side: OrderSide, position_side: PositionSide, qty: f64) -> OrderRequest {
    OrderRequest {
        client_order_id: String::new(),
        symbol: symbol.to_string(),
        side,
        position_side,
        order_type: "MARKET".to_string(),
        tif: "GTC".to_string(),
        qty,
        price: None,
        leverage: 5,
        reduce_only: false,
        stop_loss: None,
        take_profit: None,
    }
}

#[tokio::test]
async fn average_in_then_partial_close_scenario() {
    let store = Store::open_in_memory().unwrap();
    let reconciler = Reconciler::new(store.clone());

    reconciler
        .process_trade(&update(TradeAction::OpenLong, "BTCUSDT", 0.5, 100.0, 1))
        .await
        .unwrap();
    reconciler
        .process_trade(&update(TradeAction::OpenLong, "BTCUSDT", 0.5, 120.0, 2))
        .await
        .unwrap();
    reconciler
        .process_trade(&update(TradeAction::CloseLong, "BTCUSDT", 0.6, 130.0, 3))
        .await
        .unwrap();

    let pos = store
        .find_open_position("t1", "BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .expect("position still open");
    assert_eq!(pos.qty, 0.4);
    assert_eq!(pos.entry_qty, 1.0);
    assert_eq!(pos.entry_price, 110.0);
    assert_eq!(pos.exit_price, 130.0);
    assert_eq!(pos.realized_pnl, 12.0);
}

#[tokio::test]
async fn over_close_clamp_scenario() {
    let store = Store::open_in_memory().unwrap();
    let reconciler = Reconciler::new(store.clone());

    reconciler
        .process_trade(&update(TradeAction::OpenShort, "ETHUSDT", 1.0, 2000.0, 1))
        .await
        .unwrap();
    reconciler
        .process_trade(&update(TradeAction::CloseShort, "ETHUSDT", 1.2, 1900.0, 2))
        .await
        .unwrap();

    let positions = store.list_positions("t1", 10).await.unwrap();
    assert_eq!(positions.len(), 1);
    let pos = &positions[0];
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, 1900.0);
    assert_eq!(pos.realized_pnl, 100.0);
}

#[tokio::test]
async fn watermark_sync_is_idempotent() {
    let store = Store::open_in_memory().unwrap();
    let reconciler = Reconciler::new(store.clone());

    let paper = Arc::new(PaperExchange::new(Venue::Binance, 10_000.0));
    paper.set_mark_price("BTCUSDT", 100.0);
    let adapter: Arc<dyn ExchangeAdapter> = paper.clone();

    paper
        .place_order(&market_order(
            "BTCUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            0.5,
        ))
        .await
        .unwrap();
    paper.advance_clock(1000);
    paper.set_mark_price("BTCUSDT", 120.0);
    paper
        .place_order(&market_order(
            "BTCUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            0.5,
        ))
        .await
        .unwrap();

    let first = reconciler.sync_fills("t1", "e1", &adapter).await.unwrap();
    assert_eq!(first, 2);

    // Re-running the catch-up ingests nothing new; the ledger is unchanged.
    let second = reconciler.sync_fills("t1", "e1", &adapter).await.unwrap();
    assert_eq!(second, 0);
    assert_eq!(store.count_fills("e1").await.unwrap(), 2);

    let pos = store
        .find_open_position("t1", "BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pos.entry_qty, 1.0);
    assert_eq!(pos.entry_price, 110.0);

    // New activity after the watermark is picked up incrementally.
    paper.advance_clock(1000);
    paper.set_mark_price("BTCUSDT", 130.0);
    paper
        .place_order(&market_order(
            "BTCUSDT",
            OrderSide::Sell,
            PositionSide::Long,
            1.0,
        ))
        .await
        .unwrap();

    let third = reconciler.sync_fills("t1", "e1", &adapter).await.unwrap();
    assert_eq!(third, 1);

    let positions = store.list_positions("t1", 10).await.unwrap();
    let closed = positions
        .iter()
        .find(|p| p.status == PositionStatus::Closed)
        .expect("closed after full sell");
    assert_eq!(closed.exit_price, 130.0);
    assert_eq!(closed.realized_pnl, 20.0);
}

#[tokio::test]
async fn closed_pnl_import_dedups_on_position_id() {
    let store = Store::open_in_memory().unwrap();
    let reconciler = Reconciler::new(store.clone());

    let paper = Arc::new(PaperExchange::new(Venue::Bybit, 5_000.0));
    paper.set_mark_price("SOLUSDT", 150.0);
    let adapter: Arc<dyn ExchangeAdapter> = paper.clone();

    paper
        .place_order(&market_order(
            "SOLUSDT",
            OrderSide::Sell,
            PositionSide::Short,
            2.0,
        ))
        .await
        .unwrap();
    paper.advance_clock(1000);
    paper.set_mark_price("SOLUSDT", 140.0);
    paper
        .place_order(&market_order(
            "SOLUSDT",
            OrderSide::Buy,
            PositionSide::Short,
            2.0,
        ))
        .await
        .unwrap();

    let imported = reconciler
        .import_closed_pnl("t1", "e1", &adapter, 0)
        .await
        .unwrap();
    assert_eq!(imported, 1);

    // Importing the same history again is a no-op.
    let again = reconciler
        .import_closed_pnl("t1", "e1", &adapter, 0)
        .await
        .unwrap();
    assert_eq!(again, 0);

    let positions = store.list_positions("t1", 10).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::Closed);
    assert_eq!(positions[0].realized_pnl, 20.0);
    assert_eq!(positions[0].source, "sync");
}
