//! End-to-end protection flow against the synthetic exchange: entry sizing,
//! initial stop placement, break-even arming, staircase trailing, and
//! reconciliation, with the rate-limit budget and persistent store live.

use perpguard::application::position_manager::{EntryRequest, PositionManager};
use perpguard::application::rate_limit::{BudgetConfig, RateLimitBudget};
use perpguard::application::retry_queue::{RetryQueue, RetryQueueConfig};
use perpguard::application::stop_replace::StopReplaceConfig;
use perpguard::config::TradingSettings;
use perpguard::domain::ports::ExchangeApi;
use perpguard::domain::types::{PositionEvent, Side};
use perpguard::infrastructure::exchange::SyntheticExchange;
use perpguard::infrastructure::persistence::store::StateStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SYMBOL: &str = "XBTUSDTM";

struct Harness {
    manager: Arc<PositionManager>,
    exchange: Arc<SyntheticExchange>,
    store: Arc<StateStore>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        StateStore::open(dir.path().join("state.json"))
            .await
            .unwrap(),
    );
    let budget = RateLimitBudget::new(BudgetConfig::default());
    let retry_queue = Arc::new(RetryQueue::new(store.clone(), RetryQueueConfig::default()));
    let exchange = Arc::new(SyntheticExchange::new(SYMBOL, dec!(50000), dec!(10000), 99));

    let contract = exchange.contract_detail(SYMBOL).await.unwrap();
    let mut contracts = HashMap::new();
    contracts.insert(SYMBOL.to_string(), contract);

    let manager = Arc::new(PositionManager::new(
        TradingSettings::default(),
        StopReplaceConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_frac: 0.0,
            ..StopReplaceConfig::default()
        },
        exchange.clone(),
        budget,
        store.clone(),
        retry_queue,
        contracts,
    ));

    Harness {
        manager,
        exchange,
        store,
        _dir: dir,
    }
}

async fn open_default(h: &Harness) -> perpguard::domain::types::Position {
    h.manager
        .open_position(&EntryRequest {
            symbol: SYMBOL.to_string(),
            side: Side::Long,
            position_percent: dec!(0.5),
            leverage: 10,
        })
        .await
        .unwrap()
}

/// Pins the mark so the position shows exactly `roi` percent.
fn mark_for_roi(entry: Decimal, roi: Decimal, leverage: u32) -> Decimal {
    entry * (Decimal::ONE + roi / (Decimal::from(leverage) * Decimal::ONE_HUNDRED))
}

#[tokio::test]
async fn test_entry_sizes_against_equity_and_protects() {
    let h = harness().await;
    let position = open_default(&h).await;

    // 10,000 equity at 0.5% and 10x: margin 50, notional 500, ~0.009-0.01
    // contracts at a ~50,000 fill.
    assert_eq!(position.leverage, 10);
    assert!(position.size >= dec!(0.009) && position.size <= dec!(0.011));
    let notional = position.size * position.entry_price;
    assert_eq!(position.margin_used * dec!(10), notional);

    // The stop is live on the exchange before entry returns.
    assert_eq!(h.exchange.working_stop_count(), 1);
    let stop = position.stop_loss_price.unwrap();
    assert!(stop < position.entry_price);
    let tp = position.take_profit_price.unwrap();
    assert!(tp > position.entry_price);
    assert!(!position.break_even_armed);

    // Persisted copy matches the returned one.
    let persisted = h.store.position(&position.id).await.unwrap();
    assert_eq!(persisted.stop_loss_price, position.stop_loss_price);
    assert_eq!(persisted.stop_loss_order_id, position.stop_loss_order_id);
}

#[tokio::test]
async fn test_insufficient_margin_rejected() {
    let h = harness().await;
    let err = h
        .manager
        .open_position(&EntryRequest {
            symbol: SYMBOL.to_string(),
            side: Side::Long,
            position_percent: dec!(95),
            leverage: 10,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        perpguard::domain::errors::EngineError::InsufficientMargin { .. }
    ));
    assert_eq!(h.exchange.working_stop_count(), 0);
}

#[tokio::test]
async fn test_break_even_arms_at_fee_adjusted_roi() {
    let h = harness().await;
    let position = open_default(&h).await;
    let mut events = h.manager.subscribe_events();

    // Below the 1.3% fee-adjusted threshold nothing moves.
    h.exchange
        .set_mark(SYMBOL, mark_for_roi(position.entry_price, dec!(1.0), 10));
    h.manager.monitor_position(&position.id).await.unwrap();
    let unmoved = h.store.position(&position.id).await.unwrap();
    assert!(!unmoved.break_even_armed);

    // At 1.4% ROI the stop jumps past entry and the flag arms.
    h.exchange
        .set_mark(SYMBOL, mark_for_roi(position.entry_price, dec!(1.4), 10));
    h.manager.monitor_position(&position.id).await.unwrap();

    let armed = h.store.position(&position.id).await.unwrap();
    assert!(armed.break_even_armed);
    assert_eq!(armed.last_trailed_roi_step, 0);
    let stop = armed.stop_loss_price.unwrap();
    assert!(stop >= armed.entry_price, "stop {} below entry", stop);
    // Exactly one protective order remains working.
    assert_eq!(h.exchange.working_stop_count(), 1);

    // The armed event is visible to UI collaborators.
    let mut saw_armed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PositionEvent::BreakEvenArmed { .. }) {
            saw_armed = true;
        }
    }
    assert!(saw_armed);
}

#[tokio::test]
async fn test_staircase_advances_monotonically() {
    let h = harness().await;
    let position = open_default(&h).await;
    let entry = position.entry_price;

    // Arm first.
    h.exchange.set_mark(SYMBOL, mark_for_roi(entry, dec!(1.35), 10));
    h.manager.monitor_position(&position.id).await.unwrap();
    let armed_stop = h
        .store
        .position(&position.id)
        .await
        .unwrap()
        .stop_loss_price
        .unwrap();

    // A full step of ROI beyond the 1.3 anchor earns one advance.
    h.exchange.set_mark(SYMBOL, mark_for_roi(entry, dec!(1.46), 10));
    h.manager.monitor_position(&position.id).await.unwrap();
    let stepped = h.store.position(&position.id).await.unwrap();
    assert_eq!(stepped.last_trailed_roi_step, 1);
    let stepped_stop = stepped.stop_loss_price.unwrap();
    assert!(stepped_stop >= armed_stop);

    // A retreat never walks the stop back.
    h.exchange.set_mark(SYMBOL, mark_for_roi(entry, dec!(0.8), 10));
    h.manager.monitor_position(&position.id).await.unwrap();
    let retreated = h.store.position(&position.id).await.unwrap();
    assert_eq!(retreated.stop_loss_price.unwrap(), stepped_stop);
    assert_eq!(retreated.last_trailed_roi_step, 1);

    // A surge earns several steps at once and the stop keeps rising.
    h.exchange.set_mark(SYMBOL, mark_for_roi(entry, dec!(2.2), 10));
    h.manager.monitor_position(&position.id).await.unwrap();
    let surged = h.store.position(&position.id).await.unwrap();
    assert!(surged.last_trailed_roi_step > 1);
    assert!(surged.stop_loss_price.unwrap() >= stepped_stop);
    assert_eq!(h.exchange.working_stop_count(), 1);
}

#[tokio::test]
async fn test_close_realizes_net_pnl() {
    let h = harness().await;
    let position = open_default(&h).await;

    let exit_price = position.entry_price * dec!(1.002);
    let net = h
        .manager
        .close_position(&position.id, exit_price)
        .await
        .unwrap();

    // Gross is positive; fees shave it but at +2% notional it stays net
    // positive and strictly below gross.
    let gross = (exit_price - position.entry_price) * position.size;
    assert!(net > Decimal::ZERO);
    assert!(net < gross);
    assert!(h.store.position(&position.id).await.is_none());
}

#[tokio::test]
async fn test_reconciliation_closes_orphaned_store_entry() {
    let h = harness().await;
    let position = open_default(&h).await;

    // Simulate the stop filling server-side: the exchange forgets the
    // position while the store still holds it.
    h.exchange
        .place_order(&perpguard::domain::types::OrderParams {
            client_oid: "test:flatten".to_string(),
            symbol: SYMBOL.to_string(),
            side: perpguard::domain::types::OrderSide::Sell,
            order_type: perpguard::domain::types::OrderType::Market,
            price: None,
            size: position.size,
            reduce_only: true,
            stop_price: None,
            stop_price_type: None,
            leverage: 10,
        })
        .await
        .unwrap();

    h.manager.reconcile().await.unwrap();
    assert!(h.store.position(&position.id).await.is_none());
}

#[tokio::test]
async fn test_position_limit_enforced() {
    let h = harness().await;
    let mut settings = TradingSettings::default();
    settings.max_positions = 1;
    // Rebuild a manager with the tighter limit over the same store.
    let contract = h.exchange.contract_detail(SYMBOL).await.unwrap();
    let mut contracts = HashMap::new();
    contracts.insert(SYMBOL.to_string(), contract);
    let manager = PositionManager::new(
        settings,
        StopReplaceConfig::default(),
        h.exchange.clone(),
        RateLimitBudget::new(BudgetConfig::default()),
        h.store.clone(),
        Arc::new(RetryQueue::new(h.store.clone(), RetryQueueConfig::default())),
        contracts,
    );

    manager
        .open_position(&EntryRequest {
            symbol: SYMBOL.to_string(),
            side: Side::Long,
            position_percent: dec!(0.5),
            leverage: 10,
        })
        .await
        .unwrap();
    let err = manager
        .open_position(&EntryRequest {
            symbol: SYMBOL.to_string(),
            side: Side::Long,
            position_percent: dec!(0.5),
            leverage: 10,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("position limit"));
}
