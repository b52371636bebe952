//! Adaptive rate-limit budget for outbound exchange calls.
//!
//! A token bucket refills linearly toward an effective capacity of
//! `quota x utilization_target`. Waiters queue in four strict-priority
//! classes; a lower class is only dispatched when no higher class is
//! waiting. A 429 from the exchange shrinks the utilization target toward
//! its floor; a sustained window of successes relaxes it back toward the
//! ceiling.

use crate::domain::errors::{EngineError, EngineResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Priority classes, highest first. Strict ordering: `Critical` always
/// dispatches before anything else, FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Cancel/replace of a protective stop.
    Critical = 0,
    /// Entry order.
    High = 1,
    /// State sync.
    Medium = 2,
    /// Health probe.
    Low = 3,
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub quota_per_window: u32,
    pub window: Duration,
    pub utilization_initial: f64,
    pub utilization_floor: f64,
    pub utilization_ceiling: f64,
    /// Multiplied into the target on each rate-limit event.
    pub shrink_factor: f64,
    /// Clean run required before the target relaxes one notch.
    pub recovery_window: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            quota_per_window: 2000,
            window: Duration::from_millis(30_000),
            utilization_initial: 0.70,
            utilization_floor: 0.40,
            utilization_ceiling: 0.70,
            shrink_factor: 0.8,
            recovery_window: Duration::from_secs(60),
        }
    }
}

/// Point-in-time metrics for dashboards and the observability reporter.
#[derive(Debug, Clone)]
pub struct BudgetMetrics {
    pub tokens_available: f64,
    pub utilization_target: f64,
    pub consecutive_rate_limits: u32,
    pub waiters: usize,
    pub loop_lag_p50_ms: f64,
    pub loop_lag_p95_ms: f64,
    pub loop_lag_p99_ms: f64,
    pub message_jitter_p95_ms: f64,
}

struct Waiter {
    tx: oneshot::Sender<()>,
}

const LAG_SAMPLE_CAP: usize = 512;

struct BucketState {
    tokens: f64,
    utilization_target: f64,
    last_refill: Instant,
    window_started: Instant,
    granted_in_window: u32,
    consecutive_rate_limits: u32,
    last_rate_limit_at: Option<Instant>,
    last_relax_at: Instant,
    queues: [VecDeque<Waiter>; 4],
    loop_lag_ms: VecDeque<f64>,
    message_jitter_ms: VecDeque<f64>,
}

pub struct RateLimitBudget {
    config: BudgetConfig,
    state: Mutex<BucketState>,
}

impl RateLimitBudget {
    /// Builds the budget and spawns its dispatcher tick. The dispatcher
    /// exits once the last strong handle is dropped.
    pub fn new(config: BudgetConfig) -> Arc<Self> {
        let now = Instant::now();
        let capacity = config.quota_per_window as f64 * config.utilization_initial;
        let budget = Arc::new(Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                utilization_target: config.utilization_initial,
                last_refill: now,
                window_started: now,
                granted_in_window: 0,
                consecutive_rate_limits: 0,
                last_rate_limit_at: None,
                last_relax_at: now,
                queues: Default::default(),
                loop_lag_ms: VecDeque::new(),
                message_jitter_ms: VecDeque::new(),
            }),
            config,
        });

        let weak: Weak<Self> = Arc::downgrade(&budget);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(25));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(budget) = weak.upgrade() else { break };
                budget.dispatch();
            }
            debug!("RateLimitBudget dispatcher stopped");
        });

        budget
    }

    /// Acquires one token at the given priority.
    ///
    /// A `Some(Duration::ZERO)` deadline means fail immediately when no
    /// token is available; any other deadline bounds the wait. A waiter
    /// abandoned at its deadline leaks nothing: a token handed to a dead
    /// waiter is refunded during dispatch.
    pub async fn acquire(
        &self,
        priority: Priority,
        deadline: Option<Duration>,
    ) -> EngineResult<()> {
        let rx = {
            let mut state = self.state.lock().expect("budget lock poisoned");
            self.refill(&mut state);

            if self.can_grant(&state, priority) {
                self.consume(&mut state);
                return Ok(());
            }

            if deadline == Some(Duration::ZERO) {
                return Err(EngineError::QuotaExhausted);
            }

            let (tx, rx) = oneshot::channel();
            state.queues[priority as usize].push_back(Waiter { tx });
            rx
        };

        match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(EngineError::transient("budget dispatcher dropped waiter")),
                Err(_) => Err(EngineError::QuotaExhausted),
            },
            None => rx
                .await
                .map_err(|_| EngineError::transient("budget dispatcher dropped waiter")),
        }
    }

    /// Records an exchange 429. Shrinks the utilization target toward the
    /// floor and starts a fresh recovery window.
    pub fn on_rate_limited(&self) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        let previous = state.utilization_target;
        state.utilization_target =
            (previous * self.config.shrink_factor).max(self.config.utilization_floor);
        state.consecutive_rate_limits += 1;
        state.last_rate_limit_at = Some(Instant::now());
        let capacity = self.capacity(&state);
        state.tokens = state.tokens.min(capacity);
        warn!(
            "Rate limited by exchange ({} consecutive): utilization target {:.2} -> {:.2}",
            state.consecutive_rate_limits, previous, state.utilization_target
        );
    }

    /// Records a successful exchange call; resets the consecutive-429 run.
    pub fn on_success(&self) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        if state.consecutive_rate_limits > 0 {
            state.consecutive_rate_limits = 0;
        }
    }

    /// Ingest path feedback: event-loop lag sample.
    pub fn record_loop_lag(&self, lag: Duration) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        push_sample(&mut state.loop_lag_ms, lag.as_secs_f64() * 1000.0);
    }

    /// Ingest path feedback: inter-message jitter sample.
    pub fn record_message_jitter(&self, jitter: Duration) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        push_sample(&mut state.message_jitter_ms, jitter.as_secs_f64() * 1000.0);
    }

    pub fn metrics(&self) -> BudgetMetrics {
        let state = self.state.lock().expect("budget lock poisoned");
        BudgetMetrics {
            tokens_available: state.tokens,
            utilization_target: state.utilization_target,
            consecutive_rate_limits: state.consecutive_rate_limits,
            waiters: state.queues.iter().map(VecDeque::len).sum(),
            loop_lag_p50_ms: percentile(&state.loop_lag_ms, 0.50),
            loop_lag_p95_ms: percentile(&state.loop_lag_ms, 0.95),
            loop_lag_p99_ms: percentile(&state.loop_lag_ms, 0.99),
            message_jitter_p95_ms: percentile(&state.message_jitter_ms, 0.95),
        }
    }

    /// Refill, relax, and hand tokens to the highest-priority waiters.
    fn dispatch(&self) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        self.refill(&mut state);
        self.maybe_relax(&mut state);

        loop {
            if state.tokens < 1.0 || state.granted_in_window >= self.window_cap(&state) {
                break;
            }
            let Some(waiter) = pop_highest(&mut state.queues) else {
                break;
            };
            self.consume(&mut state);
            if waiter.tx.send(()).is_err() {
                // Waiter gave up at its deadline; the token goes back.
                state.tokens += 1.0;
                state.granted_in_window = state.granted_in_window.saturating_sub(1);
            }
        }
    }

    fn capacity(&self, state: &BucketState) -> f64 {
        self.config.quota_per_window as f64 * state.utilization_target
    }

    fn window_cap(&self, state: &BucketState) -> u32 {
        (self.config.quota_per_window as f64 * state.utilization_target).floor() as u32
    }

    fn can_grant(&self, state: &BucketState, priority: Priority) -> bool {
        if state.tokens < 1.0 || state.granted_in_window >= self.window_cap(state) {
            return false;
        }
        // No queue-jumping: an equal-or-higher-priority waiter goes first.
        state.queues[..=priority as usize]
            .iter()
            .all(VecDeque::is_empty)
    }

    fn consume(&self, state: &mut BucketState) {
        state.tokens -= 1.0;
        state.granted_in_window += 1;
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.last_refill = now;

        let rate = self.config.quota_per_window as f64 * state.utilization_target
            / self.config.window.as_secs_f64();
        let capacity = self.capacity(state);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * rate).min(capacity);

        if now.duration_since(state.window_started) >= self.config.window {
            state.window_started = now;
            state.granted_in_window = 0;
        }
    }

    fn maybe_relax(&self, state: &mut BucketState) {
        if state.utilization_target >= self.config.utilization_ceiling {
            return;
        }
        let now = Instant::now();
        let clean_since = state
            .last_rate_limit_at
            .map_or(true, |at| now.duration_since(at) >= self.config.recovery_window);
        let due = now.duration_since(state.last_relax_at) >= self.config.recovery_window;
        if clean_since && due {
            let previous = state.utilization_target;
            state.utilization_target =
                (previous * 1.05).min(self.config.utilization_ceiling);
            state.last_relax_at = now;
            info!(
                "Rate-limit utilization target relaxed {:.2} -> {:.2}",
                previous, state.utilization_target
            );
        }
    }
}

fn pop_highest(queues: &mut [VecDeque<Waiter>; 4]) -> Option<Waiter> {
    queues.iter_mut().find_map(VecDeque::pop_front)
}

fn push_sample(buffer: &mut VecDeque<f64>, sample: f64) {
    buffer.push_back(sample);
    if buffer.len() > LAG_SAMPLE_CAP {
        buffer.pop_front();
    }
}

fn percentile(samples: &VecDeque<f64>, q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("lag samples are finite"));
    let index = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BudgetConfig {
        BudgetConfig {
            quota_per_window: 10,
            window: Duration::from_millis(500),
            utilization_initial: 0.70,
            utilization_floor: 0.40,
            utilization_ceiling: 0.70,
            shrink_factor: 0.8,
            recovery_window: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_grants_within_capacity() {
        let budget = RateLimitBudget::new(small_config());
        // Effective capacity is 7 tokens.
        for _ in 0..7 {
            budget
                .acquire(Priority::Medium, Some(Duration::ZERO))
                .await
                .unwrap();
        }
        let err = budget
            .acquire(Priority::Medium, Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QuotaExhausted));
    }

    #[tokio::test]
    async fn test_zero_deadline_fails_fast() {
        let mut config = small_config();
        config.quota_per_window = 1;
        let budget = RateLimitBudget::new(config);
        budget
            .acquire(Priority::Low, Some(Duration::ZERO))
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_waiter_deadline_expires() {
        let budget = RateLimitBudget::new(small_config());
        for _ in 0..7 {
            budget
                .acquire(Priority::High, Some(Duration::ZERO))
                .await
                .unwrap();
        }
        let err = budget
            .acquire(Priority::High, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QuotaExhausted));
    }

    #[tokio::test]
    async fn test_critical_dispatched_before_low() {
        let budget = RateLimitBudget::new(small_config());
        // Drain every token so both requests must queue.
        for _ in 0..7 {
            budget
                .acquire(Priority::Medium, Some(Duration::ZERO))
                .await
                .unwrap();
        }

        let low = {
            let budget = budget.clone();
            tokio::spawn(async move {
                budget.acquire(Priority::Low, None).await.unwrap();
                Instant::now()
            })
        };
        // Let the low-priority waiter enqueue first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let critical = {
            let budget = budget.clone();
            tokio::spawn(async move {
                budget.acquire(Priority::Critical, None).await.unwrap();
                Instant::now()
            })
        };

        let critical_at = critical.await.unwrap();
        let low_at = low.await.unwrap();
        assert!(
            critical_at <= low_at,
            "critical waiter must be granted before low"
        );
    }

    #[tokio::test]
    async fn test_429_shrinks_target_and_recovery_relaxes() {
        let budget = RateLimitBudget::new(small_config());
        budget.on_rate_limited();
        let metrics = budget.metrics();
        assert!((metrics.utilization_target - 0.56).abs() < 1e-9);
        assert_eq!(metrics.consecutive_rate_limits, 1);

        budget.on_rate_limited();
        assert!((budget.metrics().utilization_target - 0.448).abs() < 1e-9);

        budget.on_success();
        assert_eq!(budget.metrics().consecutive_rate_limits, 0);

        // After a clean recovery window the dispatcher relaxes the target.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(budget.metrics().utilization_target > 0.448);
    }

    #[tokio::test]
    async fn test_target_clamped_to_floor() {
        let budget = RateLimitBudget::new(small_config());
        for _ in 0..10 {
            budget.on_rate_limited();
        }
        assert!((budget.metrics().utilization_target - 0.40).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_window_grant_cap_respected() {
        let mut config = small_config();
        config.window = Duration::from_millis(120);
        let budget = RateLimitBudget::new(config.clone());

        // Stay strictly inside the bucket's first window.
        let mut granted = 0u32;
        let start = Instant::now();
        while start.elapsed() < config.window - Duration::from_millis(20) {
            if budget
                .acquire(Priority::Medium, Some(Duration::ZERO))
                .await
                .is_ok()
            {
                granted += 1;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        let cap = (config.quota_per_window as f64 * 0.70).floor() as u32;
        assert!(granted <= cap, "granted {} > cap {}", granted, cap);
    }

    #[tokio::test]
    async fn test_lag_percentiles() {
        let budget = RateLimitBudget::new(small_config());
        for ms in [1u64, 2, 3, 4, 100] {
            budget.record_loop_lag(Duration::from_millis(ms));
        }
        let metrics = budget.metrics();
        assert!(metrics.loop_lag_p50_ms <= 4.0);
        assert!(metrics.loop_lag_p99_ms >= 99.0);
    }
}
