//! Stop-Replace Coordinator.
//!
//! One coordinator per position guarantees at-most-one outstanding stop
//! order and a stop that only moves in the trader's favor. The replace flow
//! places the new stop first and cancels the old one after, keeping the
//! unprotected window as small as the exchange allows. Requests arriving
//! while a replace is in flight are queued one deep: a newer request
//! supersedes an older queued one, which is safe because the stop price is
//! monotone.

use crate::application::backoff::jittered_backoff;
use crate::application::rate_limit::{Priority, RateLimitBudget};
use crate::application::retry_queue::{RetryExecutor, RetryQueue};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::{CancelOutcome, ExchangeApi};
use crate::domain::types::{ContractSpec, OrderParams, OrderRole, OrderType, Side, TriggerPriceType};
use crate::domain::validation;
use crate::infrastructure::persistence::store::RetryOperation;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Canceling,
    Placing,
    Confirmed,
    Unprotected,
    Critical,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Canceling => "canceling",
            CoordinatorState::Placing => "placing",
            CoordinatorState::Confirmed => "confirmed",
            CoordinatorState::Unprotected => "unprotected",
            CoordinatorState::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct StopReplaceConfig {
    pub max_replace_attempts: u32,
    pub max_cancel_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_frac: f64,
    /// Bound on each budget acquisition.
    pub acquire_deadline: Duration,
}

impl Default for StopReplaceConfig {
    fn default() -> Self {
        Self {
            max_replace_attempts: 5,
            max_cancel_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_frac: 0.2,
            acquire_deadline: Duration::from_secs(10),
        }
    }
}

/// How a replace call was taken.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceAck {
    /// Executed inline; the new stop order id is attached.
    Applied { order_id: String },
    /// A replace was already in flight; this request waits its turn (and
    /// may be superseded by a newer one).
    Queued,
}

/// Receiver for coordinator outcomes, implemented by the lifecycle manager.
/// The coordinator only knows the position by identifier.
#[async_trait]
pub trait StopStateSink: Send + Sync {
    async fn stop_confirmed(&self, position_id: &str, order_id: &str, stop_price: Decimal);
    async fn position_unprotected(&self, position_id: &str, context: &str);
    async fn position_critical(&self, position_id: &str, context: &str);
}

/// Payload persisted for replayed cancel operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelStopPayload {
    pub symbol: String,
    pub order_id: String,
}

struct Inner {
    state: CoordinatorState,
    current_stop_id: Option<String>,
    current_stop_price: Option<Decimal>,
    /// Monotonic sequence for idempotency keys; bumped per logical
    /// placement, not per retry attempt.
    seq: u64,
    pending: Option<PendingRequest>,
    processing: bool,
    /// Size of the exposure the latest request protects; what an emergency
    /// close must flatten.
    protected_size: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    stop_price: Decimal,
    size: Decimal,
}

pub struct StopReplaceCoordinator {
    position_id: String,
    side: Side,
    contract: ContractSpec,
    leverage: u32,
    stop_price_type: TriggerPriceType,
    exchange: Arc<dyn ExchangeApi>,
    budget: Arc<RateLimitBudget>,
    retry_queue: Arc<RetryQueue>,
    sink: Arc<dyn StopStateSink>,
    config: StopReplaceConfig,
    inner: Mutex<Inner>,
}

impl StopReplaceCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position_id: String,
        side: Side,
        contract: ContractSpec,
        leverage: u32,
        stop_price_type: TriggerPriceType,
        exchange: Arc<dyn ExchangeApi>,
        budget: Arc<RateLimitBudget>,
        retry_queue: Arc<RetryQueue>,
        sink: Arc<dyn StopStateSink>,
        config: StopReplaceConfig,
    ) -> Self {
        Self {
            position_id,
            side,
            contract,
            leverage,
            stop_price_type,
            exchange,
            budget,
            retry_queue,
            sink,
            config,
            inner: Mutex::new(Inner {
                state: CoordinatorState::Idle,
                current_stop_id: None,
                current_stop_price: None,
                seq: 0,
                pending: None,
                processing: false,
                protected_size: None,
            }),
        }
    }

    /// Adopt an already-working stop (startup reconciliation).
    pub async fn adopt_stop(&self, order_id: String, stop_price: Decimal, seq: u64) {
        let mut inner = self.inner.lock().await;
        inner.current_stop_id = Some(order_id);
        inner.current_stop_price = Some(stop_price);
        inner.seq = inner.seq.max(seq);
        inner.state = CoordinatorState::Confirmed;
    }

    pub async fn state(&self) -> CoordinatorState {
        self.inner.lock().await.state
    }

    pub async fn current_stop(&self) -> Option<(String, Decimal)> {
        let inner = self.inner.lock().await;
        match (&inner.current_stop_id, inner.current_stop_price) {
            (Some(id), Some(price)) => Some((id.clone(), price)),
            _ => None,
        }
    }

    /// The only public mutator: move the protective stop to `stop_price`.
    ///
    /// Returns `Queued` when a replace is already in flight; the queued
    /// request (at most one, newest wins) is applied after the current one
    /// confirms. Fails with `StopReplaceFailed` only after the emergency
    /// close has been attempted.
    pub async fn replace(&self, stop_price: Decimal, size: Decimal) -> EngineResult<ReplaceAck> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == CoordinatorState::Critical {
                return Err(EngineError::StopReplaceFailed {
                    state: inner.state.to_string(),
                    last_error: "coordinator is critical; not accepting requests".to_string(),
                });
            }
            if let Some(current) = inner.current_stop_price {
                if !self.is_favorable(stop_price, current) {
                    warn!(
                        "[{}] Ignoring stop replace to {} against current {}",
                        self.position_id, stop_price, current
                    );
                    return Ok(ReplaceAck::Applied {
                        order_id: inner.current_stop_id.clone().unwrap_or_default(),
                    });
                }
            }
            if inner.processing {
                if inner.pending.is_some() {
                    info!(
                        "[{}] Superseding queued stop request with {}",
                        self.position_id, stop_price
                    );
                }
                inner.pending = Some(PendingRequest { stop_price, size });
                return Ok(ReplaceAck::Queued);
            }
            inner.processing = true;
        }

        let mut request = PendingRequest { stop_price, size };
        let mut first_outcome: Option<EngineResult<ReplaceAck>> = None;
        loop {
            let outcome = self.execute_replace(&request).await;
            if first_outcome.is_none() {
                first_outcome = Some(outcome.map(|order_id| ReplaceAck::Applied { order_id }));
            }

            let mut inner = self.inner.lock().await;
            if inner.state == CoordinatorState::Critical {
                inner.pending = None;
                inner.processing = false;
                break;
            }
            match inner.pending.take() {
                // The stop may have advanced while this request was queued;
                // re-check before executing so a stale request cannot walk
                // the stop backward.
                Some(next)
                    if inner
                        .current_stop_price
                        .is_none_or(|current| self.is_favorable(next.stop_price, current)) =>
                {
                    request = next;
                }
                Some(stale) => {
                    info!(
                        "[{}] Dropping stale queued stop {}",
                        self.position_id, stale.stop_price
                    );
                    inner.processing = false;
                    break;
                }
                None => {
                    inner.processing = false;
                    break;
                }
            }
        }

        first_outcome.expect("replace loop ran at least once")
    }

    fn is_favorable(&self, candidate: Decimal, current: Decimal) -> bool {
        match self.side {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }

    fn stop_params(&self, request: &PendingRequest, client_oid: String) -> OrderParams {
        OrderParams {
            client_oid,
            symbol: self.contract.symbol.clone(),
            side: self.side.exit_order_side(),
            order_type: OrderType::Stop,
            price: None,
            size: request.size,
            reduce_only: true,
            stop_price: Some(request.stop_price),
            stop_price_type: Some(self.stop_price_type),
            leverage: self.leverage,
        }
    }

    /// Place the new stop, then cancel the old one, then confirm.
    async fn execute_replace(&self, request: &PendingRequest) -> EngineResult<String> {
        let (old_stop, client_oid) = {
            let mut inner = self.inner.lock().await;
            inner.seq += 1;
            inner.state = CoordinatorState::Placing;
            inner.protected_size = Some(request.size);
            (
                inner.current_stop_id.clone(),
                format!("{}:sl:{}", self.position_id, inner.seq),
            )
        };

        let params = validation::sanitize(
            &self.stop_params(request, client_oid),
            OrderRole::StopLoss,
        );
        if let Err(e) = validation::validate_stop_order(&params, self.side, &self.contract) {
            let mut inner = self.inner.lock().await;
            inner.state = if inner.current_stop_id.is_some() {
                CoordinatorState::Confirmed
            } else {
                CoordinatorState::Idle
            };
            return Err(e);
        }

        let new_order_id = match self.place_with_retries(&params).await {
            Ok(order_id) => order_id,
            Err(e) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = CoordinatorState::Unprotected;
                }
                self.sink
                    .position_unprotected(&self.position_id, &e.to_string())
                    .await;
                return self.escalate_critical(e).await;
            }
        };

        if let Some(old_order_id) = old_stop {
            {
                let mut inner = self.inner.lock().await;
                inner.state = CoordinatorState::Canceling;
            }
            self.cancel_old_stop(&old_order_id).await;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = CoordinatorState::Confirmed;
            inner.current_stop_id = Some(new_order_id.clone());
            inner.current_stop_price = Some(request.stop_price);
        }
        self.sink
            .stop_confirmed(&self.position_id, &new_order_id, request.stop_price)
            .await;
        info!(
            "[{}] Stop confirmed at {} ({})",
            self.position_id, request.stop_price, new_order_id
        );
        Ok(new_order_id)
    }

    async fn place_with_retries(&self, params: &OrderParams) -> EngineResult<String> {
        let mut last_error = EngineError::transient("no attempt made");
        for attempt in 0..self.config.max_replace_attempts {
            if attempt > 0 {
                let delay = jittered_backoff(
                    self.config.base_delay,
                    self.config.max_delay,
                    attempt - 1,
                    self.config.jitter_frac,
                );
                tokio::time::sleep(delay).await;
            }
            self.budget
                .acquire(Priority::Critical, Some(self.config.acquire_deadline))
                .await?;
            match self.exchange.place_stop_order(params).await {
                Ok(ack) => {
                    self.budget.on_success();
                    return Ok(ack.order_id);
                }
                Err(EngineError::RateLimited) => {
                    self.budget.on_rate_limited();
                    last_error = EngineError::RateLimited;
                }
                Err(e @ EngineError::TransientNetwork { .. }) => {
                    warn!(
                        "[{}] Stop placement attempt {} failed: {}",
                        self.position_id,
                        attempt + 1,
                        e
                    );
                    last_error = e;
                }
                // Validation and logic errors don't improve with retries.
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Cancels the superseded stop. An already-filled or missing old stop is
    /// tolerated; a transient failure past the attempt limit is handed to
    /// the durable retry queue.
    async fn cancel_old_stop(&self, order_id: &str) {
        for attempt in 0..self.config.max_cancel_attempts {
            if attempt > 0 {
                let delay = jittered_backoff(
                    self.config.base_delay,
                    self.config.max_delay,
                    attempt - 1,
                    self.config.jitter_frac,
                );
                tokio::time::sleep(delay).await;
            }
            let acquired = self
                .budget
                .acquire(Priority::Critical, Some(self.config.acquire_deadline))
                .await;
            if acquired.is_err() {
                continue;
            }
            match self
                .exchange
                .cancel_stop_order(&self.contract.symbol, order_id)
                .await
            {
                Ok(CancelOutcome::Canceled) => {
                    self.budget.on_success();
                    return;
                }
                Ok(CancelOutcome::AlreadyFilled) => {
                    // The old stop filled while we were replacing; the new
                    // stop is primary and reconciliation will pick up the
                    // closed position.
                    info!(
                        "[{}] Old stop {} already filled during replace",
                        self.position_id, order_id
                    );
                    self.budget.on_success();
                    return;
                }
                Ok(CancelOutcome::NotFound) => {
                    self.budget.on_success();
                    return;
                }
                Err(EngineError::RateLimited) => {
                    self.budget.on_rate_limited();
                }
                Err(e) => {
                    warn!(
                        "[{}] Cancel of old stop {} failed (attempt {}): {}",
                        self.position_id,
                        order_id,
                        attempt + 1,
                        e
                    );
                }
            }
        }

        let payload = CancelStopPayload {
            symbol: self.contract.symbol.clone(),
            order_id: order_id.to_string(),
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => {
                if let Err(e) = self
                    .retry_queue
                    .enqueue(RetryOperation::CancelStop, payload)
                    .await
                {
                    error!(
                        "[{}] Failed to enqueue cancel of {}: {:#}",
                        self.position_id, order_id, e
                    );
                }
            }
            Err(e) => error!("[{}] Cancel payload unserializable: {}", self.position_id, e),
        }
    }

    /// Retries exhausted: flatten the position with a reduce-only market
    /// order, mark the coordinator critical, and surface the failure.
    async fn escalate_critical(&self, cause: EngineError) -> EngineResult<String> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = CoordinatorState::Critical;
        }
        error!(
            "[{}] Stop replacement exhausted retries ({}); attempting emergency close",
            self.position_id, cause
        );

        let close_result = self.emergency_close().await;
        let context = match &close_result {
            Ok(()) => format!("stop replace failed ({}); emergency close submitted", cause),
            Err(close_err) => {
                format!(
                    "stop replace failed ({}); emergency close ALSO failed ({})",
                    cause, close_err
                )
            }
        };
        self.sink
            .position_critical(&self.position_id, &context)
            .await;

        Err(EngineError::StopReplaceFailed {
            state: CoordinatorState::Critical.to_string(),
            last_error: context,
        })
    }

    async fn emergency_close(&self) -> EngineResult<()> {
        let size = {
            let inner = self.inner.lock().await;
            inner.protected_size.unwrap_or(self.contract.min_order_qty)
        };
        let params = validation::sanitize(
            &OrderParams {
                client_oid: format!("{}:close:emergency", self.position_id),
                symbol: self.contract.symbol.clone(),
                side: self.side.exit_order_side(),
                order_type: OrderType::Market,
                price: None,
                size,
                reduce_only: true,
                stop_price: None,
                stop_price_type: None,
                leverage: self.leverage,
            },
            OrderRole::Exit,
        );
        validation::validate_exit_order(&params, self.side, &self.contract)?;
        self.budget
            .acquire(Priority::Critical, Some(self.config.acquire_deadline))
            .await?;
        self.exchange.place_order(&params).await.map(|_| ())
    }
}

/// Replays persisted stop operations from the retry queue.
pub struct StopRetryExecutor {
    exchange: Arc<dyn ExchangeApi>,
    budget: Arc<RateLimitBudget>,
}

impl StopRetryExecutor {
    pub fn new(exchange: Arc<dyn ExchangeApi>, budget: Arc<RateLimitBudget>) -> Self {
        Self { exchange, budget }
    }
}

#[async_trait]
impl RetryExecutor for StopRetryExecutor {
    async fn execute(
        &self,
        operation: RetryOperation,
        payload: &serde_json::Value,
    ) -> EngineResult<()> {
        match operation {
            RetryOperation::CancelStop => {
                let payload: CancelStopPayload = serde_json::from_value(payload.clone())
                    .map_err(|e| EngineError::invalid_input(format!("bad cancel payload: {}", e)))?;
                self.budget
                    .acquire(Priority::Critical, Some(Duration::from_secs(10)))
                    .await?;
                match self
                    .exchange
                    .cancel_stop_order(&payload.symbol, &payload.order_id)
                    .await
                {
                    Ok(_) => {
                        self.budget.on_success();
                        Ok(())
                    }
                    Err(EngineError::RateLimited) => {
                        self.budget.on_rate_limited();
                        Err(EngineError::RateLimited)
                    }
                    Err(e) => Err(e),
                }
            }
            RetryOperation::PlaceStop => {
                let params: OrderParams = serde_json::from_value(payload.clone())
                    .map_err(|e| EngineError::invalid_input(format!("bad place payload: {}", e)))?;
                self.budget
                    .acquire(Priority::Critical, Some(Duration::from_secs(10)))
                    .await?;
                match self.exchange.place_stop_order(&params).await {
                    Ok(_) => {
                        self.budget.on_success();
                        Ok(())
                    }
                    Err(EngineError::RateLimited) => {
                        self.budget.on_rate_limited();
                        Err(EngineError::RateLimited)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}
