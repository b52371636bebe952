pub mod ingest;
pub mod ohlc;

use crate::domain::types::{Candle, Timeframe};

/// One closed candle on one subscription. The ingest layer publishes
/// exactly one event per closed candle per `(symbol, timeframe)`.
#[derive(Debug, Clone)]
pub struct CandleEvent {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle: Candle,
}
