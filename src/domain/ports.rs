//! Ports consumed by the engine core. The concrete exchange transport lives
//! in infrastructure; the core only sees this surface.

use crate::domain::errors::EngineResult;
use crate::domain::types::{Candle, ContractSpec, OrderParams, Side, Timeframe};
use async_trait::async_trait;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct AccountOverview {
    pub equity: Decimal,
    pub available_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    /// Fill price when the venue reports it synchronously (market orders in
    /// demo mode); otherwise the caller queries the mark price.
    pub fill_price: Option<Decimal>,
}

/// Exchange-side view of an open position, used for reconciliation.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}

/// Result of a cancel request. An already-filled stop is not an error for
/// the replace flow; the caller decides what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    AlreadyFilled,
    NotFound,
}

/// REST surface of the exchange. Every call is subject to the caller's
/// rate-limit budget and a client timeout of at most 10 seconds.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn account_overview(&self) -> EngineResult<AccountOverview>;

    async fn contract_detail(&self, symbol: &str) -> EngineResult<ContractSpec>;

    async fn place_order(&self, params: &OrderParams) -> EngineResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<CancelOutcome>;

    async fn place_stop_order(&self, params: &OrderParams) -> EngineResult<OrderAck>;

    async fn cancel_stop_order(&self, symbol: &str, order_id: &str)
    -> EngineResult<CancelOutcome>;

    async fn mark_price(&self, symbol: &str) -> EngineResult<Decimal>;

    async fn open_positions(&self) -> EngineResult<Vec<ExchangePosition>>;

    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>>;
}
