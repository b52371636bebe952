//! Perpguard - semi-automated perpetual-futures position protection.
//!
//! Headless composition root: wires the rate-limit budget, persistent
//! store, retry queue, market-data ingest, signal generator, and position
//! manager, then runs until SIGINT. Metrics are pushed as JSON lines to
//! stdout; nothing listens for incoming connections except the configured
//! control port owner (an external dashboard collaborator).
//!
//! # Usage
//! ```sh
//! DEMO_MODE=true cargo run
//! ```
//!
//! Credentials for live mode come from the environment
//! (`EXCHANGE_API_KEY`, `EXCHANGE_API_SECRET`, `EXCHANGE_API_PASSPHRASE`)
//! and are never persisted.

use anyhow::{Context, Result};
use clap::Parser;
use perpguard::application::market_data::ingest::{IngestConfig, MarketDataIngest};
use perpguard::application::position_manager::PositionManager;
use perpguard::application::rate_limit::{BudgetConfig, RateLimitBudget};
use perpguard::application::retry_queue::{RetryQueue, RetryQueueConfig};
use perpguard::application::stop_replace::{StopReplaceConfig, StopRetryExecutor};
use perpguard::config::{EngineConfig, profile};
use perpguard::domain::ports::ExchangeApi;
use perpguard::domain::signal::{IndicatorBank, SignalGenerator};
use perpguard::domain::types::Timeframe;
use perpguard::infrastructure::exchange::{RestCredentials, RestExchange, SyntheticExchange};
use perpguard::infrastructure::observability::{Metrics, MetricsReporter};
use perpguard::infrastructure::persistence::store::StateStore;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "perpguard", about = "Perpetual-futures position protection engine")]
struct Cli {
    /// Run against the synthetic in-process exchange.
    #[arg(long)]
    demo: bool,
    /// Signal profile to activate at startup.
    #[arg(long)]
    profile: Option<String>,
    /// Override the configured listen port.
    #[arg(long)]
    listen_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Perpguard {} starting", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::from_env().context("Failed to load configuration")?;
    if cli.demo {
        config.process.demo_mode = true;
    }
    if let Some(port) = cli.listen_port {
        config.process.listen_port = port;
    }
    if let Some(profile_name) = cli.profile {
        config.process.signal_profile = profile_name;
    }
    info!(
        "Configuration: demo={}, symbols={:?}, profile={}, dashboard port {}",
        config.process.demo_mode,
        config.process.symbols,
        config.process.signal_profile,
        config.process.listen_port
    );

    // Shared long-lived services, owned here and handed down.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let budget = RateLimitBudget::new(BudgetConfig {
        quota_per_window: config.rate_limiter.quota_per_window,
        window: Duration::from_millis(config.rate_limiter.window_ms),
        utilization_initial: config.rate_limiter.utilization_target_initial,
        utilization_floor: config.rate_limiter.utilization_target_floor,
        ..BudgetConfig::default()
    });
    let store = Arc::new(
        StateStore::open(&config.process.state_path)
            .await
            .context("Failed to open state store")?,
    );
    let retry_queue = Arc::new(RetryQueue::new(store.clone(), RetryQueueConfig::default()));

    let mut synthetic: Option<Arc<SyntheticExchange>> = None;
    let exchange: Arc<dyn ExchangeApi> = if config.process.demo_mode {
        let symbol = config
            .process
            .symbols
            .first()
            .cloned()
            .unwrap_or_else(|| "XBTUSDTM".to_string());
        info!("Demo mode: synthetic exchange for {}", symbol);
        let inner = Arc::new(SyntheticExchange::new(
            &symbol,
            dec!(50000),
            dec!(10000),
            0xC0FFEE,
        ));
        synthetic = Some(inner.clone());
        inner
    } else {
        let credentials =
            RestCredentials::from_env().context("Exchange credentials missing from environment")?;
        let base_url = std::env::var("EXCHANGE_BASE_URL")
            .unwrap_or_else(|_| "https://api-futures.example.com".to_string());
        Arc::new(RestExchange::new(
            base_url,
            credentials,
            Duration::from_millis(config.api.request_timeout_ms),
        ))
    };

    // Contract specifications are immutable for the session.
    let mut contracts = HashMap::new();
    for symbol in &config.process.symbols {
        let contract = exchange
            .contract_detail(symbol)
            .await
            .map_err(|e| anyhow::anyhow!("contract detail for {}: {}", symbol, e))?;
        info!(
            "Contract {}: tick {}, lot {}, multiplier {}",
            symbol, contract.tick_size, contract.lot_size, contract.multiplier
        );
        contracts.insert(symbol.clone(), contract);
    }

    // Signal scoring: profile catalog plus one indicator bank per symbol.
    let catalog = match &config.process.profiles_path {
        Some(path) => profile::load_profiles(Path::new(path))?,
        None => Vec::new(),
    };
    let generator = Arc::new(SignalGenerator::from_catalog(
        &catalog,
        &config.process.signal_profile,
    ));

    let manager = Arc::new(PositionManager::new(
        config.trading.clone(),
        StopReplaceConfig::default(),
        exchange.clone(),
        budget.clone(),
        store.clone(),
        retry_queue.clone(),
        contracts,
    ));

    let ingest = Arc::new(MarketDataIngest::new(
        IngestConfig {
            ws_url: std::env::var("EXCHANGE_WS_URL")
                .unwrap_or_else(|_| "wss://stream.example.com/candles".to_string()),
            ..IngestConfig::default()
        },
        config
            .process
            .symbols
            .iter()
            .map(|s| (s.clone(), Timeframe::OneMin))
            .collect(),
        budget.clone(),
    ));

    let metrics = Metrics::new().context("Failed to build metrics registry")?;
    let reporter = MetricsReporter::new(
        metrics,
        budget.clone(),
        manager.clone(),
        store.clone(),
        Duration::from_secs(60),
    );

    // Service tasks.
    let mut tasks = Vec::new();
    {
        let retry_queue = retry_queue.clone();
        let executor = Arc::new(StopRetryExecutor::new(exchange.clone(), budget.clone()));
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            retry_queue.run(executor, shutdown).await;
        }));
    }
    if !config.process.demo_mode {
        let ingest = ingest.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            ingest.run(shutdown).await;
        }));
    }
    {
        let manager = manager.clone();
        let shutdown = shutdown_rx.clone();
        let reconcile = Duration::from_secs(config.process.reconcile_interval_secs);
        tasks.push(tokio::spawn(async move {
            manager.run(Duration::from_secs(2), reconcile, shutdown).await;
        }));
    }
    {
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            reporter.run(shutdown).await;
        }));
    }

    // Demo mode drives the synthetic market and logs composite signals so
    // the protection loop has something to chew on.
    if let Some(synthetic) = synthetic {
        let generator = generator.clone();
        let symbols = config.process.symbols.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            run_demo_market(synthetic, generator, symbols, shutdown).await;
        }));
    }

    info!("Engine running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested; draining tasks");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Demo loop: steps the random walk, feeds candles into an indicator bank,
/// and logs the composite score once warm.
async fn run_demo_market(
    exchange: Arc<SyntheticExchange>,
    generator: Arc<SignalGenerator>,
    symbols: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(symbol) = symbols.first().cloned() else {
        return;
    };
    let mut bank = IndicatorBank::new();

    // Warm the bank from synthetic history.
    match exchange
        .historical_candles(&symbol, Timeframe::OneMin, 120)
        .await
    {
        Ok(history) => {
            for candle in &history {
                bank.update(candle);
            }
            info!("Warmed indicators from {} candles", history.len());
        }
        Err(e) => warn!("Indicator warm-up failed: {}", e),
    }

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut timestamp = chrono::Utc::now().timestamp_millis();
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let Some(mark) = exchange.step(&symbol) else { continue };
                timestamp += 60_000;
                let spread = mark * dec!(0.0003);
                bank.update(&perpguard::domain::types::Candle {
                    timestamp,
                    open: mark - spread,
                    high: mark + spread,
                    low: mark - spread,
                    close: mark,
                    volume: dec!(50),
                });
                let signal = generator.generate(&bank.readings());
                info!(
                    "{} mark {} score {} class {:?}",
                    symbol, mark, signal.score, signal.class
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
