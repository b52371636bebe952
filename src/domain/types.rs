use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of an open exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Price feed a stop order triggers against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPriceType {
    MarkPrice,
    LastPrice,
}

/// Per-symbol contract specification, loaded at startup and immutable for
/// the life of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: String,
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Minimum quantity increment, in contracts.
    pub lot_size: Decimal,
    /// Quantity-to-notional scale.
    pub multiplier: Decimal,
    pub min_order_qty: Decimal,
    pub max_order_qty: Decimal,
    /// Maintenance-margin rate as a percent (e.g. 0.5 = 0.5%).
    pub maintenance_margin_percent: Decimal,
}

/// One open exposure on one symbol. Mutated only by the position lifecycle
/// manager; every field change hits the persistent store before the change
/// is acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    /// Filled size in contracts.
    pub size: Decimal,
    pub leverage: u32,
    pub margin_used: Decimal,
    pub entry_fee_rate: Decimal,
    pub exit_fee_rate: Decimal,
    pub stop_loss_order_id: Option<String>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_order_id: Option<String>,
    pub take_profit_price: Option<Decimal>,
    pub break_even_armed: bool,
    /// Count of staircase advances applied since arming.
    pub last_trailed_roi_step: u32,
    pub created_at: DateTime<Utc>,
    pub last_stop_update_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Notional exposure: size x entry x multiplier.
    pub fn notional(&self, multiplier: Decimal) -> Decimal {
        self.size * self.entry_price * multiplier
    }
}

/// Closed OHLCV bar with a UTC millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Median price (high + low) / 2, used by the awesome oscillator.
    pub fn median_price(&self) -> Decimal {
        (self.high + self.low) / Decimal::TWO
    }
}

/// Candle interval for market-data subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    OneMin,
    FiveMin,
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::FiveMin => 5,
            Timeframe::FifteenMin => 15,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440,
        }
    }

    pub fn to_millis(&self) -> i64 {
        self.to_minutes() * 60_000
    }

    /// Wire string for the exchange candle channel.
    pub fn to_wire_string(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1min",
            Timeframe::FiveMin => "5min",
            Timeframe::FifteenMin => "15min",
            Timeframe::OneHour => "1hour",
            Timeframe::FourHour => "4hour",
            Timeframe::OneDay => "1day",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire_string())
    }
}

/// Parameters for an order submission toward the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    /// Client-supplied idempotency key.
    pub client_oid: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
    pub size: Decimal,
    pub reduce_only: bool,
    pub stop_price: Option<Decimal>,
    pub stop_price_type: Option<TriggerPriceType>,
    pub leverage: u32,
}

/// Role an order plays, used by the validator to pick its rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    Entry,
    Exit,
    StopLoss,
    TakeProfit,
}

/// Events published by the position lifecycle manager for UI collaborators.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened {
        position: Position,
    },
    Updated {
        position_id: String,
        mark_price: Decimal,
        roi_percent: Decimal,
    },
    StopMoved {
        position_id: String,
        stop_price: Decimal,
        reason: String,
    },
    BreakEvenArmed {
        position_id: String,
        stop_price: Decimal,
    },
    Closed {
        position_id: String,
        exit_price: Decimal,
        realized_pnl: Decimal,
    },
    Critical {
        position_id: String,
        context: String,
    },
    ReconciliationAlert {
        position_id: String,
        context: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_order_mapping() {
        assert_eq!(Side::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_candle_median_price() {
        let candle = Candle {
            timestamp: 0,
            open: dec!(10),
            high: dec!(12),
            low: dec!(8),
            close: dec!(11),
            volume: dec!(100),
        };
        assert_eq!(candle.median_price(), dec!(10));
    }

    #[test]
    fn test_timeframe_wire_strings() {
        assert_eq!(Timeframe::OneMin.to_wire_string(), "1min");
        assert_eq!(Timeframe::FourHour.to_millis(), 14_400_000);
    }

    #[test]
    fn test_side_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"long\"");
        let side: Side = serde_json::from_str("\"short\"").unwrap();
        assert_eq!(side, Side::Short);
    }
}
