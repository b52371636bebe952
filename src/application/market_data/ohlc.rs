//! Pull-based historical OHLC with a TTL + LRU cache.
//!
//! Cache keys are `(source, symbol, timeframe, limit)`; entries expire after
//! the TTL and the least-recently-used entry is evicted past the cap.

use crate::application::rate_limit::{Priority, RateLimitBudget};
use crate::domain::errors::EngineResult;
use crate::domain::ports::ExchangeApi;
use crate::domain::types::{Candle, Timeframe};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

type CacheKey = (String, String, Timeframe, usize);

struct CacheEntry {
    fetched_at: Instant,
    candles: Vec<Candle>,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Most recently used last.
    usage: Vec<CacheKey>,
}

impl CacheState {
    fn touch(&mut self, key: &CacheKey) {
        self.usage.retain(|k| k != key);
        self.usage.push(key.clone());
    }
}

pub struct OhlcProvider {
    source: String,
    exchange: Arc<dyn ExchangeApi>,
    budget: Arc<RateLimitBudget>,
    ttl: Duration,
    capacity: usize,
    cache: Mutex<CacheState>,
}

impl OhlcProvider {
    pub fn new(
        source: impl Into<String>,
        exchange: Arc<dyn ExchangeApi>,
        budget: Arc<RateLimitBudget>,
        ttl: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            source: source.into(),
            exchange,
            budget,
            ttl,
            capacity: capacity.max(1),
            cache: Mutex::new(CacheState {
                entries: HashMap::new(),
                usage: Vec::new(),
            }),
        }
    }

    /// Fetches up to `limit` closed candles, newest last, serving from the
    /// cache when fresh.
    pub async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>> {
        let key: CacheKey = (self.source.clone(), symbol.to_string(), timeframe, limit);

        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.entries.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    let candles = entry.candles.clone();
                    cache.touch(&key);
                    debug!("OHLC cache hit for {} {} x{}", symbol, timeframe, limit);
                    return Ok(candles);
                }
                cache.entries.remove(&key);
                cache.usage.retain(|k| k != &key);
            }
        }

        self.budget
            .acquire(Priority::Low, Some(Duration::from_secs(10)))
            .await?;
        let candles = self
            .exchange
            .historical_candles(symbol, timeframe, limit)
            .await?;

        let mut cache = self.cache.lock().await;
        cache.entries.insert(
            key.clone(),
            CacheEntry {
                fetched_at: Instant::now(),
                candles: candles.clone(),
            },
        );
        cache.touch(&key);
        while cache.entries.len() > self.capacity {
            let Some(oldest) = cache.usage.first().cloned() else {
                break;
            };
            cache.usage.remove(0);
            cache.entries.remove(&oldest);
            debug!("OHLC cache evicted {:?}", oldest);
        }
        Ok(candles)
    }
}
