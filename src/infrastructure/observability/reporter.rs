//! Push-based metrics reporter.
//!
//! Periodically refreshes the Prometheus gauges from live engine state and
//! emits one structured JSON line to stdout. Nothing here accepts incoming
//! connections.

use super::metrics::Metrics;
use crate::application::position_manager::PositionManager;
use crate::application::rate_limit::RateLimitBudget;
use crate::infrastructure::persistence::store::StateStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;

#[derive(Serialize)]
struct ReportLine {
    timestamp: String,
    uptime_seconds: u64,
    positions_open: usize,
    budget_tokens_available: f64,
    budget_utilization_target: f64,
    budget_rate_limit_streak: u32,
    loop_lag_p95_ms: f64,
    loop_lag_p99_ms: f64,
    message_jitter_p95_ms: f64,
    retry_queue_depth: usize,
    retry_dead_letters: usize,
}

pub struct MetricsReporter {
    metrics: Metrics,
    budget: Arc<RateLimitBudget>,
    manager: Arc<PositionManager>,
    store: Arc<StateStore>,
    interval: Duration,
    started: Instant,
}

impl MetricsReporter {
    pub fn new(
        metrics: Metrics,
        budget: Arc<RateLimitBudget>,
        manager: Arc<PositionManager>,
        store: Arc<StateStore>,
        interval: Duration,
    ) -> Self {
        Self {
            metrics,
            budget,
            manager,
            store,
            interval,
            started: Instant::now(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Metrics reporter started (interval {:?})", self.interval);
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.report().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn report(&self) {
        let budget = self.budget.metrics();
        let positions = self.manager.open_positions().await;
        let pending = self.store.retry_entries().await.len();
        let dead = self.store.dead_letters().await.len();

        self.metrics
            .budget_tokens_available
            .set(budget.tokens_available);
        self.metrics
            .budget_utilization_target
            .set(budget.utilization_target);
        self.metrics
            .budget_rate_limit_streak
            .set(budget.consecutive_rate_limits as f64);
        self.metrics.budget_waiters.set(budget.waiters as f64);
        self.metrics.positions_open.set(positions.len() as f64);
        self.metrics.retry_queue_depth.set(pending as f64);
        self.metrics.retry_dead_letters.set(dead as f64);

        let line = ReportLine {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: self.started.elapsed().as_secs(),
            positions_open: positions.len(),
            budget_tokens_available: budget.tokens_available,
            budget_utilization_target: budget.utilization_target,
            budget_rate_limit_streak: budget.consecutive_rate_limits,
            loop_lag_p95_ms: budget.loop_lag_p95_ms,
            loop_lag_p99_ms: budget.loop_lag_p99_ms,
            message_jitter_p95_ms: budget.message_jitter_p95_ms,
            retry_queue_depth: pending,
            retry_dead_letters: dead,
        };
        match serde_json::to_string(&line) {
            Ok(json) => println!("METRICS_JSON:{}", json),
            Err(e) => tracing::warn!("Failed to serialize metrics line: {}", e),
        }
    }
}
