//! Position lifecycle management: sizing, entry, protective exit, and
//! reconciliation against exchange state.
//!
//! All transitions for a given position run on the manager's single monitor
//! loop, so per-position state is single-writer. Stop mutations go through
//! the position's stop-replace coordinator, which is the serialization
//! point for protective orders. Every field change is written through the
//! persistent store before the mutation is acknowledged.

use crate::application::rate_limit::{Priority, RateLimitBudget};
use crate::application::retry_queue::RetryQueue;
use crate::application::stop_replace::{
    ReplaceAck, StopReplaceConfig, StopReplaceCoordinator, StopStateSink,
};
use crate::config::TradingSettings;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::math::{self, RoundDirection};
use crate::domain::ports::ExchangeApi;
use crate::domain::trailing::{self, StopContext, StopReason};
use crate::domain::types::{
    ContractSpec, OrderParams, OrderRole, OrderType, Position, PositionEvent, Side,
    TriggerPriceType,
};
use crate::domain::validation;
use crate::infrastructure::persistence::store::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Fraction of equity that entry margin may not exceed.
const MAX_MARGIN_EQUITY_RATIO: Decimal = dec!(0.9);

#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: Side,
    /// Percent of account equity committed as margin.
    pub position_percent: Decimal,
    pub leverage: u32,
}

/// Persists coordinator outcomes and forwards them as events. Kept separate
/// from the manager so the coordinator never holds a manager reference.
struct PositionStateSink {
    store: Arc<StateStore>,
    events: broadcast::Sender<PositionEvent>,
}

#[async_trait]
impl StopStateSink for PositionStateSink {
    async fn stop_confirmed(&self, position_id: &str, order_id: &str, stop_price: Decimal) {
        let Some(mut position) = self.store.position(position_id).await else {
            warn!("Stop confirmed for unknown position {}", position_id);
            return;
        };
        position.stop_loss_order_id = Some(order_id.to_string());
        position.stop_loss_price = Some(stop_price);
        position.last_stop_update_at = Some(Utc::now());
        if let Err(e) = self.store.upsert_position(&position).await {
            error!("Failed to persist stop for {}: {:#}", position_id, e);
        }
    }

    async fn position_unprotected(&self, position_id: &str, context: &str) {
        warn!("Position {} unprotected: {}", position_id, context);
    }

    async fn position_critical(&self, position_id: &str, context: &str) {
        let _ = self.events.send(PositionEvent::Critical {
            position_id: position_id.to_string(),
            context: context.to_string(),
        });
    }
}

pub struct PositionManager {
    trading: TradingSettings,
    stop_replace_config: StopReplaceConfig,
    exchange: Arc<dyn ExchangeApi>,
    budget: Arc<RateLimitBudget>,
    store: Arc<StateStore>,
    retry_queue: Arc<RetryQueue>,
    contracts: HashMap<String, ContractSpec>,
    coordinators: Mutex<HashMap<String, Arc<StopReplaceCoordinator>>>,
    events: broadcast::Sender<PositionEvent>,
}

impl PositionManager {
    pub fn new(
        trading: TradingSettings,
        stop_replace_config: StopReplaceConfig,
        exchange: Arc<dyn ExchangeApi>,
        budget: Arc<RateLimitBudget>,
        store: Arc<StateStore>,
        retry_queue: Arc<RetryQueue>,
        contracts: HashMap<String, ContractSpec>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            trading,
            stop_replace_config,
            exchange,
            budget,
            store,
            retry_queue,
            contracts,
            coordinators: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.store.positions().await
    }

    fn contract(&self, symbol: &str) -> EngineResult<&ContractSpec> {
        self.contracts
            .get(symbol)
            .ok_or_else(|| EngineError::invalid_input(format!("unknown symbol {}", symbol)))
    }

    fn sink(&self) -> Arc<dyn StopStateSink> {
        Arc::new(PositionStateSink {
            store: self.store.clone(),
            events: self.events.clone(),
        })
    }

    async fn coordinator_for(&self, position: &Position) -> EngineResult<Arc<StopReplaceCoordinator>> {
        let contract = self.contract(&position.symbol)?.clone();
        let mut coordinators = self.coordinators.lock().await;
        if let Some(existing) = coordinators.get(&position.id) {
            return Ok(existing.clone());
        }
        let coordinator = Arc::new(StopReplaceCoordinator::new(
            position.id.clone(),
            position.side,
            contract,
            position.leverage,
            TriggerPriceType::MarkPrice,
            self.exchange.clone(),
            self.budget.clone(),
            self.retry_queue.clone(),
            self.sink(),
            self.stop_replace_config.clone(),
        ));
        coordinators.insert(position.id.clone(), coordinator.clone());
        Ok(coordinator)
    }

    /// Opens a position: size against equity, submit the entry, then hang
    /// the initial protective stop and take-profit on it. Entry failures
    /// surface to the caller and are not retried.
    pub async fn open_position(&self, request: &EntryRequest) -> EngineResult<Position> {
        let open_count = self.store.positions().await.len() as u32;
        if open_count >= self.trading.max_positions {
            return Err(EngineError::invalid_input(format!(
                "position limit reached ({}/{})",
                open_count, self.trading.max_positions
            )));
        }
        let contract = self.contract(&request.symbol)?.clone();
        if request.leverage == 0 {
            return Err(EngineError::invalid_input("leverage must be >= 1"));
        }

        self.budget
            .acquire(Priority::Medium, Some(Duration::from_secs(10)))
            .await?;
        let account = self.exchange.account_overview().await?;

        let margin = math::calculate_margin_used(account.equity, request.position_percent)?;
        if margin > account.equity * MAX_MARGIN_EQUITY_RATIO {
            return Err(EngineError::InsufficientMargin {
                required: margin,
                available: account.equity * MAX_MARGIN_EQUITY_RATIO,
            });
        }

        self.budget
            .acquire(Priority::Medium, Some(Duration::from_secs(10)))
            .await?;
        let reference_price = self.exchange.mark_price(&request.symbol).await?;

        let notional = math::calculate_position_value(margin, request.leverage)?;
        let size = math::calculate_lot_size(
            notional,
            reference_price,
            contract.multiplier,
            contract.lot_size,
            contract.min_order_qty,
            contract.max_order_qty,
        )?;

        let position_id = Uuid::new_v4().to_string();
        let entry_params = validation::sanitize(
            &OrderParams {
                client_oid: format!("{}:entry", position_id),
                symbol: request.symbol.clone(),
                side: request.side.entry_order_side(),
                order_type: OrderType::Market,
                price: None,
                size,
                reduce_only: false,
                stop_price: None,
                stop_price_type: None,
                leverage: request.leverage,
            },
            OrderRole::Entry,
        );

        self.budget
            .acquire(Priority::High, Some(Duration::from_secs(10)))
            .await?;
        let ack = self.exchange.place_order(&entry_params).await?;
        let entry_price = match ack.fill_price {
            Some(price) => price,
            None => {
                self.budget
                    .acquire(Priority::Medium, Some(Duration::from_secs(10)))
                    .await?;
                self.exchange.mark_price(&request.symbol).await?
            }
        };

        // margin_used is recomputed from the fill so the notional identity
        // holds exactly on the persisted record.
        let filled_notional = size * entry_price * contract.multiplier;
        let margin_used = filled_notional / Decimal::from(request.leverage);

        let mut position = Position {
            id: position_id,
            symbol: request.symbol.clone(),
            side: request.side,
            entry_price,
            size,
            leverage: request.leverage,
            margin_used,
            entry_fee_rate: self.trading.taker_fee,
            exit_fee_rate: self.trading.taker_fee,
            stop_loss_order_id: None,
            stop_loss_price: None,
            take_profit_order_id: None,
            take_profit_price: None,
            break_even_armed: false,
            last_trailed_roi_step: 0,
            created_at: Utc::now(),
            last_stop_update_at: None,
        };
        self.store
            .upsert_position(&position)
            .await
            .map_err(|e| EngineError::transient(format!("persist failed: {:#}", e)))?;

        // Initial stop: adverse-direction tick rounding keeps the realized
        // risk at or inside the configured ROI.
        let raw_stop = math::calculate_stop_loss_price(
            request.side,
            entry_price,
            self.trading.initial_sl_roi,
            request.leverage,
        )?;
        let stop_direction = match request.side {
            Side::Long => RoundDirection::Down,
            Side::Short => RoundDirection::Up,
        };
        let stop_price =
            math::round_to_tick_directed(raw_stop, contract.tick_size, stop_direction)?;
        self.check_stop_invariants(&position, stop_price, &contract)?;

        let coordinator = self.coordinator_for(&position).await?;
        coordinator.replace(stop_price, size).await?;

        // Take-profit is a plain reduce-only limit order, placed directly.
        let raw_tp = math::calculate_take_profit_price(
            request.side,
            entry_price,
            self.trading.initial_tp_roi,
            request.leverage,
        )?;
        let tp_price = math::round_to_tick(raw_tp, contract.tick_size)?;
        let tp_params = validation::sanitize(
            &OrderParams {
                client_oid: format!("{}:tp:1", position.id),
                symbol: request.symbol.clone(),
                side: request.side.exit_order_side(),
                order_type: OrderType::Limit,
                price: Some(tp_price),
                size,
                reduce_only: true,
                stop_price: None,
                stop_price_type: None,
                leverage: request.leverage,
            },
            OrderRole::TakeProfit,
        );
        validation::validate_exit_order(&tp_params, request.side, &contract)?;
        self.budget
            .acquire(Priority::High, Some(Duration::from_secs(10)))
            .await?;
        match self.exchange.place_order(&tp_params).await {
            Ok(tp_ack) => {
                position.take_profit_order_id = Some(tp_ack.order_id);
                position.take_profit_price = Some(tp_price);
            }
            Err(e) => {
                // The stop is live; a missing TP only caps upside.
                warn!("[{}] Take-profit placement failed: {}", position.id, e);
            }
        }

        // Merge the stop fields the coordinator sink persisted.
        if let Some(persisted) = self.store.position(&position.id).await {
            position.stop_loss_order_id = persisted.stop_loss_order_id;
            position.stop_loss_price = persisted.stop_loss_price;
            position.last_stop_update_at = persisted.last_stop_update_at;
        }
        self.store
            .upsert_position(&position)
            .await
            .map_err(|e| EngineError::transient(format!("persist failed: {:#}", e)))?;

        info!(
            "[{}] Opened {} {} x{} @ {} (margin {}, stop {:?}, tp {:?})",
            position.id,
            position.symbol,
            position.side,
            position.leverage,
            position.entry_price,
            position.margin_used,
            position.stop_loss_price,
            position.take_profit_price,
        );
        let _ = self.events.send(PositionEvent::Opened {
            position: position.clone(),
        });
        Ok(position)
    }

    /// One protection pass over a single position: compute ROI, arm
    /// break-even when earned, and advance the trailing staircase.
    pub async fn monitor_position(&self, position_id: &str) -> EngineResult<()> {
        let Some(mut position) = self.store.position(position_id).await else {
            return Ok(());
        };
        let contract = self.contract(&position.symbol)?.clone();

        self.budget
            .acquire(Priority::Medium, Some(Duration::from_secs(10)))
            .await?;
        let mark = self.exchange.mark_price(&position.symbol).await?;

        let diff = math::signed_price_diff(position.side, position.entry_price, mark);
        let pnl = math::calculate_unrealized_pnl(diff, position.size, contract.multiplier);
        let roi = math::calculate_roi_percent(pnl, position.margin_used)?;

        let _ = self.events.send(PositionEvent::Updated {
            position_id: position.id.clone(),
            mark_price: mark,
            roi_percent: roi,
        });

        let decision = trailing::next_stop(
            &StopContext {
                side: position.side,
                entry: position.entry_price,
                current_stop: position.stop_loss_price,
                leverage: position.leverage,
                entry_fee_rate: position.entry_fee_rate,
                exit_fee_rate: position.exit_fee_rate,
                current_roi: roi,
                last_roi_step: position.last_trailed_roi_step,
                break_even_armed: position.break_even_armed,
            },
            &self.trading.trailing(),
        )?;

        let Some(raw_stop) = decision.new_stop else {
            return Ok(());
        };
        // Favorable-direction rounding: a protective move is never rounded
        // back across the level the policy locked.
        let stop_price = math::round_stop_to_tick(position.side, raw_stop, contract.tick_size)?;

        let coordinator = self.coordinator_for(&position).await?;
        match coordinator.replace(stop_price, position.size).await? {
            ReplaceAck::Applied { .. } => {
                position.break_even_armed = decision.break_even_armed;
                position.last_trailed_roi_step = decision.new_last_step;
                // Stop id/price were persisted by the coordinator sink;
                // merge before writing the policy fields through.
                if let Some(persisted) = self.store.position(&position.id).await {
                    position.stop_loss_order_id = persisted.stop_loss_order_id;
                    position.stop_loss_price = persisted.stop_loss_price;
                    position.last_stop_update_at = persisted.last_stop_update_at;
                }
                self.store
                    .upsert_position(&position)
                    .await
                    .map_err(|e| EngineError::transient(format!("persist failed: {:#}", e)))?;

                let event = match decision.reason {
                    StopReason::BreakEven => PositionEvent::BreakEvenArmed {
                        position_id: position.id.clone(),
                        stop_price,
                    },
                    _ => PositionEvent::StopMoved {
                        position_id: position.id.clone(),
                        stop_price,
                        reason: "trailing_advance".to_string(),
                    },
                };
                let _ = self.events.send(event);
            }
            ReplaceAck::Queued => {
                // The coordinator confirms asynchronously; the policy fields
                // advance on the next monitor pass against the updated stop.
            }
        }
        Ok(())
    }

    /// Marks a position closed after its stop or take-profit filled.
    /// Realized PnL is net of entry and exit fees.
    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: Decimal,
    ) -> EngineResult<Decimal> {
        let Some(position) = self.store.position(position_id).await else {
            return Err(EngineError::invalid_input(format!(
                "unknown position {}",
                position_id
            )));
        };
        let contract = self.contract(&position.symbol)?;

        let diff = math::signed_price_diff(position.side, position.entry_price, exit_price);
        let gross = math::calculate_unrealized_pnl(diff, position.size, contract.multiplier);
        let entry_notional = position.size * position.entry_price * contract.multiplier;
        let exit_notional = position.size * exit_price * contract.multiplier;
        let fees =
            entry_notional * position.entry_fee_rate + exit_notional * position.exit_fee_rate;
        let net = gross - fees;

        self.store
            .remove_position(position_id)
            .await
            .map_err(|e| EngineError::transient(format!("persist failed: {:#}", e)))?;
        self.coordinators.lock().await.remove(position_id);

        info!(
            "[{}] Closed at {} (gross {}, fees {}, net {})",
            position_id, exit_price, gross, fees, net
        );
        let _ = self.events.send(PositionEvent::Closed {
            position_id: position_id.to_string(),
            exit_price,
            realized_pnl: net,
        });
        Ok(net)
    }

    /// Compares persisted positions against exchange state. A store entry
    /// with no exchange counterpart closes at its last-known protective
    /// price; an exchange position missing from the store raises an alert.
    pub async fn reconcile(&self) -> EngineResult<()> {
        self.budget
            .acquire(Priority::Medium, Some(Duration::from_secs(10)))
            .await?;
        let exchange_positions = self.exchange.open_positions().await?;

        let stored = self.store.positions().await;
        for position in &stored {
            let on_exchange = exchange_positions
                .iter()
                .any(|p| p.symbol == position.symbol && p.side == position.side);
            if !on_exchange {
                let exit_price = position.stop_loss_price.unwrap_or(position.entry_price);
                warn!(
                    "[{}] Exchange no longer reports this position; closing at {}",
                    position.id, exit_price
                );
                let _ = self.events.send(PositionEvent::ReconciliationAlert {
                    position_id: position.id.clone(),
                    context: "position gone from exchange".to_string(),
                });
                self.close_position(&position.id, exit_price).await?;
            }
        }

        for exchange_position in &exchange_positions {
            let tracked = stored
                .iter()
                .any(|p| p.symbol == exchange_position.symbol && p.side == exchange_position.side);
            if !tracked {
                warn!(
                    "Untracked {} {} position on exchange",
                    exchange_position.symbol, exchange_position.side
                );
                let _ = self.events.send(PositionEvent::ReconciliationAlert {
                    position_id: String::new(),
                    context: format!(
                        "untracked {} {} position on exchange",
                        exchange_position.symbol, exchange_position.side
                    ),
                });
            }
        }
        Ok(())
    }

    /// Drives monitoring and periodic reconciliation until shutdown.
    /// Positions are visited sequentially, so each is single-writer.
    pub async fn run(
        &self,
        monitor_interval: Duration,
        reconcile_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Position manager running (monitor {:?}, reconcile {:?})",
            monitor_interval, reconcile_interval
        );
        if let Err(e) = self.reconcile().await {
            warn!("Startup reconciliation failed: {}", e);
        }

        let mut monitor_tick = tokio::time::interval(monitor_interval);
        monitor_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reconcile_tick = tokio::time::interval(reconcile_interval);
        reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = monitor_tick.tick() => {
                    for position in self.store.positions().await {
                        if let Err(e) = self.monitor_position(&position.id).await {
                            warn!("[{}] Monitor pass failed: {}", position.id, e);
                        }
                    }
                }
                _ = reconcile_tick.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!("Reconciliation failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Position manager stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Refuses a stop whose geometry breaks the position invariants:
    /// pre-arming stops sit on the protective side of entry, and the
    /// liquidation price is strictly beyond the stop.
    fn check_stop_invariants(
        &self,
        position: &Position,
        stop_price: Decimal,
        contract: &ContractSpec,
    ) -> EngineResult<()> {
        if !position.break_even_armed {
            let ok = match position.side {
                Side::Long => stop_price <= position.entry_price,
                Side::Short => stop_price >= position.entry_price,
            };
            if !ok {
                return Err(EngineError::invariant(format!(
                    "unarmed stop {} on the wrong side of entry {}",
                    stop_price, position.entry_price
                )));
            }
        }
        let liquidation = math::calculate_liquidation_price(
            position.side,
            position.entry_price,
            position.leverage,
            contract.maintenance_margin_percent,
        )?;
        let beyond = match position.side {
            Side::Long => liquidation < stop_price,
            Side::Short => liquidation > stop_price,
        };
        if !beyond {
            return Err(EngineError::invariant(format!(
                "liquidation {} not strictly beyond stop {}",
                liquidation, stop_price
            )));
        }
        Ok(())
    }
}
