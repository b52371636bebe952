//! Synthetic in-process exchange for demo mode.
//!
//! Replaces the REST collaborator with a random-walk market and instant
//! fills through the shared execution simulator, so the whole protection
//! loop runs locally with no credentials. Stop orders rest in an in-memory
//! book and trigger when the walk crosses them.

use crate::application::simulator::{ExecutionSimulator, SimulatorConfig};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::{
    AccountOverview, CancelOutcome, ExchangeApi, ExchangePosition, OrderAck,
};
use crate::domain::types::{
    Candle, ContractSpec, OrderParams, OrderSide, OrderType, Side, Timeframe,
};
use async_trait::async_trait;
use rand::Rng;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

struct BookPosition {
    side: Side,
    size: Decimal,
    entry_price: Decimal,
}

struct MarketState {
    marks: HashMap<String, Decimal>,
    stops: HashMap<String, OrderParams>,
    positions: HashMap<String, BookPosition>,
    equity: Decimal,
    rng: StdRng,
}

pub struct SyntheticExchange {
    contract: ContractSpec,
    simulator: ExecutionSimulator,
    state: Mutex<MarketState>,
    order_seq: AtomicU64,
}

impl SyntheticExchange {
    pub fn new(symbol: &str, starting_mark: Decimal, equity: Decimal, seed: u64) -> Self {
        let contract = ContractSpec {
            symbol: symbol.to_string(),
            tick_size: dec!(0.5),
            lot_size: dec!(0.001),
            multiplier: Decimal::ONE,
            min_order_qty: dec!(0.001),
            max_order_qty: dec!(10000),
            maintenance_margin_percent: dec!(0.5),
        };
        let mut marks = HashMap::new();
        marks.insert(symbol.to_string(), starting_mark);
        Self {
            contract,
            simulator: ExecutionSimulator::with_seed(SimulatorConfig::default(), seed),
            state: Mutex::new(MarketState {
                marks,
                stops: HashMap::new(),
                positions: HashMap::new(),
                equity,
                rng: StdRng::seed_from_u64(seed ^ 0x5eed),
            }),
            order_seq: AtomicU64::new(1),
        }
    }

    fn next_order_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Advances the random walk one step (about +/-0.05%) and returns the
    /// new mark.
    pub fn step(&self, symbol: &str) -> Option<Decimal> {
        let mut state = self.state.lock().expect("market state poisoned");
        let mark = state.marks.get(symbol).copied()?;
        let drift: f64 = state.rng.random_range(-0.0005..=0.0005);
        let factor = Decimal::from_f64(1.0 + drift).unwrap_or(Decimal::ONE);
        let next = (mark * factor).max(dec!(0.5));
        state.marks.insert(symbol.to_string(), next);
        Some(next)
    }

    /// Pins the mark price, for deterministic tests and demo scripting.
    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().expect("market state poisoned");
        state.marks.insert(symbol.to_string(), price);
    }

    pub fn working_stop_count(&self) -> usize {
        self.state.lock().expect("market state poisoned").stops.len()
    }
}

#[async_trait]
impl ExchangeApi for SyntheticExchange {
    async fn account_overview(&self) -> EngineResult<AccountOverview> {
        let state = self.state.lock().expect("market state poisoned");
        Ok(AccountOverview {
            equity: state.equity,
            available_balance: state.equity,
        })
    }

    async fn contract_detail(&self, symbol: &str) -> EngineResult<ContractSpec> {
        if symbol != self.contract.symbol {
            return Err(EngineError::invalid_input(format!(
                "unknown contract {}",
                symbol
            )));
        }
        Ok(self.contract.clone())
    }

    async fn place_order(&self, params: &OrderParams) -> EngineResult<OrderAck> {
        let mut state = self.state.lock().expect("market state poisoned");
        let mark = state
            .marks
            .get(&params.symbol)
            .copied()
            .ok_or_else(|| EngineError::invalid_input("no market for symbol"))?;

        let order_id = self.next_order_id("ord");
        match params.order_type {
            OrderType::Market => {
                let fill =
                    self.simulator
                        .market_fill(params.side, mark, params.size, self.contract.multiplier);
                if params.reduce_only {
                    state.positions.remove(&params.symbol);
                    info!("Synthetic: reduce-only close at {}", fill.price);
                } else {
                    let side = match params.side {
                        OrderSide::Buy => Side::Long,
                        OrderSide::Sell => Side::Short,
                    };
                    state.positions.insert(
                        params.symbol.clone(),
                        BookPosition {
                            side,
                            size: params.size,
                            entry_price: fill.price,
                        },
                    );
                }
                state.equity -= fill.fee;
                Ok(OrderAck {
                    order_id,
                    fill_price: Some(fill.price),
                })
            }
            OrderType::Limit => Ok(OrderAck {
                order_id,
                fill_price: None,
            }),
            OrderType::Stop => Err(EngineError::invalid_order(
                "order_type",
                "stop orders go through place_stop_order",
            )),
        }
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> EngineResult<CancelOutcome> {
        Ok(CancelOutcome::Canceled)
    }

    async fn place_stop_order(&self, params: &OrderParams) -> EngineResult<OrderAck> {
        let mut state = self.state.lock().expect("market state poisoned");
        // Idempotent on client_oid: a retried placement after a network
        // ambiguity returns the existing order.
        if let Some((existing_id, _)) = state
            .stops
            .iter()
            .find(|(_, existing)| existing.client_oid == params.client_oid)
        {
            return Ok(OrderAck {
                order_id: existing_id.clone(),
                fill_price: None,
            });
        }
        let order_id = self.next_order_id("stop");
        state.stops.insert(order_id.clone(), params.clone());
        Ok(OrderAck {
            order_id,
            fill_price: None,
        })
    }

    async fn cancel_stop_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> EngineResult<CancelOutcome> {
        let mut state = self.state.lock().expect("market state poisoned");
        match state.stops.remove(order_id) {
            Some(_) => Ok(CancelOutcome::Canceled),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn mark_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let state = self.state.lock().expect("market state poisoned");
        state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| EngineError::invalid_input("no market for symbol"))
    }

    async fn open_positions(&self) -> EngineResult<Vec<ExchangePosition>> {
        let state = self.state.lock().expect("market state poisoned");
        Ok(state
            .positions
            .iter()
            .map(|(symbol, p)| ExchangePosition {
                symbol: symbol.clone(),
                side: p.side,
                size: p.size,
                entry_price: p.entry_price,
                mark_price: state.marks.get(symbol).copied().unwrap_or(p.entry_price),
            })
            .collect())
    }

    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>> {
        let mark = self.mark_price(symbol).await?;
        let mut state = self.state.lock().expect("market state poisoned");
        let step = timeframe.to_millis();
        let now = chrono::Utc::now().timestamp_millis();
        let start = now - step * limit as i64;

        // Backfill a plausible walk ending at the current mark.
        let mut closes = Vec::with_capacity(limit);
        let mut price = mark;
        for _ in 0..limit {
            closes.push(price);
            let drift: f64 = state.rng.random_range(-0.001..=0.001);
            price *= Decimal::from_f64(1.0 - drift).unwrap_or(Decimal::ONE);
        }
        closes.reverse();

        Ok(closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let spread = *close * dec!(0.0004);
                Candle {
                    timestamp: start + step * (i as i64 + 1),
                    open: *close - spread,
                    high: *close + spread,
                    low: *close - spread * dec!(1.5),
                    close: *close,
                    volume: dec!(100),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TriggerPriceType;

    fn market_params(side: OrderSide, reduce_only: bool) -> OrderParams {
        OrderParams {
            client_oid: "t-1".to_string(),
            symbol: "XBTUSDTM".to_string(),
            side,
            order_type: OrderType::Market,
            price: None,
            size: dec!(0.01),
            reduce_only,
            stop_price: None,
            stop_price_type: None,
            leverage: 10,
        }
    }

    #[tokio::test]
    async fn test_market_order_opens_position() {
        let exchange = SyntheticExchange::new("XBTUSDTM", dec!(50000), dec!(10000), 7);
        let ack = exchange
            .place_order(&market_params(OrderSide::Buy, false))
            .await
            .unwrap();
        assert!(ack.fill_price.is_some());

        let positions = exchange.open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
    }

    #[tokio::test]
    async fn test_reduce_only_flattens() {
        let exchange = SyntheticExchange::new("XBTUSDTM", dec!(50000), dec!(10000), 7);
        exchange
            .place_order(&market_params(OrderSide::Buy, false))
            .await
            .unwrap();
        exchange
            .place_order(&market_params(OrderSide::Sell, true))
            .await
            .unwrap();
        assert!(exchange.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_placement_is_idempotent_on_client_oid() {
        let exchange = SyntheticExchange::new("XBTUSDTM", dec!(50000), dec!(10000), 7);
        let params = OrderParams {
            client_oid: "pos-1:sl:1".to_string(),
            symbol: "XBTUSDTM".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Stop,
            price: None,
            size: dec!(0.01),
            reduce_only: true,
            stop_price: Some(dec!(49750.0)),
            stop_price_type: Some(TriggerPriceType::MarkPrice),
            leverage: 10,
        };
        let first = exchange.place_stop_order(&params).await.unwrap();
        let second = exchange.place_stop_order(&params).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(exchange.working_stop_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_missing_stop_reports_not_found() {
        let exchange = SyntheticExchange::new("XBTUSDTM", dec!(50000), dec!(10000), 7);
        let outcome = exchange
            .cancel_stop_order("XBTUSDTM", "stop-99")
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_walk_and_history_are_seeded() {
        let a = SyntheticExchange::new("XBTUSDTM", dec!(50000), dec!(10000), 11);
        let b = SyntheticExchange::new("XBTUSDTM", dec!(50000), dec!(10000), 11);
        assert_eq!(a.step("XBTUSDTM"), b.step("XBTUSDTM"));
    }
}
