//! Prometheus metrics for the protection engine.
//!
//! All metrics use the `perpguard_` prefix. The registry is push-style:
//! nothing here opens a listening socket.

use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Tokens currently available in the rate-limit bucket
    pub budget_tokens_available: GenericGauge<AtomicF64>,
    /// Current utilization target (0-1)
    pub budget_utilization_target: GenericGauge<AtomicF64>,
    /// Consecutive 429 responses
    pub budget_rate_limit_streak: GenericGauge<AtomicF64>,
    /// Waiters parked in the budget queues
    pub budget_waiters: GenericGauge<AtomicF64>,
    /// Open positions
    pub positions_open: GenericGauge<AtomicF64>,
    /// Positions flagged critical
    pub positions_critical: GenericGauge<AtomicF64>,
    /// Stop replacements by outcome
    pub stop_replacements_total: CounterVec,
    /// Event-loop lag on the ingest path, seconds
    pub ingest_loop_lag_seconds: HistogramVec,
    /// WebSocket reconnects
    pub websocket_reconnects_total: CounterVec,
    /// Retry-queue entries waiting
    pub retry_queue_depth: GenericGauge<AtomicF64>,
    /// Dead-lettered retry entries
    pub retry_dead_letters: GenericGauge<AtomicF64>,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let budget_tokens_available = Gauge::with_opts(Opts::new(
            "perpguard_budget_tokens_available",
            "Tokens currently available in the rate-limit bucket",
        ))?;
        registry.register(Box::new(budget_tokens_available.clone()))?;

        let budget_utilization_target = Gauge::with_opts(Opts::new(
            "perpguard_budget_utilization_target",
            "Adaptive utilization target (0-1)",
        ))?;
        registry.register(Box::new(budget_utilization_target.clone()))?;

        let budget_rate_limit_streak = Gauge::with_opts(Opts::new(
            "perpguard_budget_rate_limit_streak",
            "Consecutive 429 responses from the exchange",
        ))?;
        registry.register(Box::new(budget_rate_limit_streak.clone()))?;

        let budget_waiters = Gauge::with_opts(Opts::new(
            "perpguard_budget_waiters",
            "Acquisitions waiting in the priority queues",
        ))?;
        registry.register(Box::new(budget_waiters.clone()))?;

        let positions_open = Gauge::with_opts(Opts::new(
            "perpguard_positions_open",
            "Open positions under management",
        ))?;
        registry.register(Box::new(positions_open.clone()))?;

        let positions_critical = Gauge::with_opts(Opts::new(
            "perpguard_positions_critical",
            "Positions whose protective stop could not be restored",
        ))?;
        registry.register(Box::new(positions_critical.clone()))?;

        let stop_replacements_total = CounterVec::new(
            Opts::new(
                "perpguard_stop_replacements_total",
                "Stop replacement outcomes",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(stop_replacements_total.clone()))?;

        let ingest_loop_lag_seconds = HistogramVec::new(
            HistogramOpts::new(
                "perpguard_ingest_loop_lag_seconds",
                "Handling latency per market-data frame",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(ingest_loop_lag_seconds.clone()))?;

        let websocket_reconnects_total = CounterVec::new(
            Opts::new(
                "perpguard_websocket_reconnects_total",
                "Market-data socket reconnects",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(websocket_reconnects_total.clone()))?;

        let retry_queue_depth = Gauge::with_opts(Opts::new(
            "perpguard_retry_queue_depth",
            "Pending retry-queue entries",
        ))?;
        registry.register(Box::new(retry_queue_depth.clone()))?;

        let retry_dead_letters = Gauge::with_opts(Opts::new(
            "perpguard_retry_dead_letters",
            "Retry entries parked for human attention",
        ))?;
        registry.register(Box::new(retry_dead_letters.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            budget_tokens_available,
            budget_utilization_target,
            budget_rate_limit_streak,
            budget_waiters,
            positions_open,
            positions_critical,
            stop_replacements_total,
            ingest_loop_lag_seconds,
            websocket_reconnects_total,
            retry_queue_depth,
            retry_dead_letters,
        })
    }

    /// Text exposition of the full registry.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let metrics = Metrics::new().unwrap();
        metrics.budget_tokens_available.set(1400.0);
        metrics.positions_open.set(2.0);
        metrics
            .stop_replacements_total
            .with_label_values(&["confirmed"])
            .inc();

        let text = metrics.gather().unwrap();
        assert!(text.contains("perpguard_budget_tokens_available 1400"));
        assert!(text.contains("perpguard_positions_open 2"));
        assert!(text.contains("perpguard_stop_replacements_total"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        // Two instances keep separate registries, so both succeed.
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.positions_open.set(1.0);
        second.positions_open.set(5.0);
        assert!(first.gather().unwrap().contains("perpguard_positions_open 1"));
    }
}
