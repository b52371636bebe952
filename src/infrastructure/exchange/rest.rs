//! Signed REST transport for the futures exchange.
//!
//! Implements the `ExchangeApi` port over the venue's REST surface with
//! HMAC-SHA256 request signing. Responses are mapped onto the engine error
//! taxonomy at this boundary: 429 becomes `RateLimited`, 5xx and transport
//! failures become `TransientNetwork`, and order rejections become
//! `InvalidOrder`. Raw venue error strings never travel further up.

use super::http::HttpClientFactory;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::{
    AccountOverview, CancelOutcome, ExchangeApi, ExchangePosition, OrderAck,
};
use crate::domain::types::{
    Candle, ContractSpec, OrderParams, OrderType, Side, Timeframe, TriggerPriceType,
};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RestCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

impl RestCredentials {
    /// Credentials come from the process environment, never from config
    /// files.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            api_key: std::env::var("EXCHANGE_API_KEY")?,
            api_secret: std::env::var("EXCHANGE_API_SECRET")?,
            api_passphrase: std::env::var("EXCHANGE_API_PASSPHRASE").unwrap_or_default(),
        })
    }
}

pub struct RestExchange {
    base_url: String,
    credentials: RestCredentials,
    read_client: ClientWithMiddleware,
    write_client: ClientWithMiddleware,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    #[serde(rename = "accountEquity")]
    account_equity: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct WireOrderAck {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "dealPrice")]
    deal_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContract {
    symbol: String,
    #[serde(rename = "tickSize")]
    tick_size: String,
    #[serde(rename = "lotSize")]
    lot_size: String,
    multiplier: String,
    #[serde(rename = "minOrderQty")]
    min_order_qty: String,
    #[serde(rename = "maxOrderQty")]
    max_order_qty: String,
    #[serde(rename = "maintainMargin")]
    maintain_margin: String,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    symbol: String,
    #[serde(rename = "currentQty")]
    current_qty: String,
    #[serde(rename = "avgEntryPrice")]
    avg_entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct WireMark {
    value: String,
}

fn parse_decimal(raw: &str, field: &str) -> EngineResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|_| EngineError::invalid_input(format!("unparseable {} '{}'", field, raw)))
}

impl RestExchange {
    pub fn new(base_url: String, credentials: RestCredentials, timeout: Duration) -> Self {
        Self {
            base_url,
            credentials,
            read_client: HttpClientFactory::read_client(timeout),
            write_client: HttpClientFactory::write_client(timeout),
        }
    }

    /// HMAC-SHA256 over `timestamp + method + path + body`.
    fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        is_write: bool,
    ) -> EngineResult<T> {
        let timestamp = Utc::now().timestamp_millis();
        let body_text = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let signature = self.sign(timestamp, method.as_str(), path, &body_text);
        let url = format!("{}{}", self.base_url, path);

        let client = if is_write {
            &self.write_client
        } else {
            &self.read_client
        };
        let mut request = client
            .request(method, &url)
            .header("PG-API-KEY", &self.credentials.api_key)
            .header("PG-API-SIGN", signature)
            .header("PG-API-TIMESTAMP", timestamp.to_string())
            .header("PG-API-PASSPHRASE", &self.credentials.api_passphrase);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::transient(format!("request to {} failed: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        if status.is_server_error() {
            return Err(EngineError::transient(format!(
                "{} returned {}",
                path, status
            )));
        }
        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            EngineError::transient(format!("bad response from {}: {}", path, e))
        })?;
        if status.is_client_error() || envelope.code != "200000" {
            let reason = envelope
                .msg
                .unwrap_or_else(|| format!("venue code {}", envelope.code));
            warn!("Exchange rejected {}: {}", path, reason);
            return Err(EngineError::invalid_order("request", reason));
        }
        envelope
            .data
            .ok_or_else(|| EngineError::transient(format!("{} returned empty data", path)))
    }

    fn order_body(params: &OrderParams) -> serde_json::Value {
        let mut body = serde_json::json!({
            "clientOid": params.client_oid,
            "symbol": params.symbol,
            "side": match params.side {
                crate::domain::types::OrderSide::Buy => "buy",
                crate::domain::types::OrderSide::Sell => "sell",
            },
            "type": match params.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
                OrderType::Stop => "market",
            },
            "size": params.size.to_string(),
            "reduceOnly": params.reduce_only,
            "leverage": params.leverage.to_string(),
        });
        if let Some(price) = params.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if let Some(stop_price) = params.stop_price {
            body["stopPrice"] = serde_json::json!(stop_price.to_string());
            body["stopPriceType"] = serde_json::json!(match params.stop_price_type {
                Some(TriggerPriceType::LastPrice) => "TP",
                // Mark price is the default trigger for protective stops.
                _ => "MP",
            });
        }
        body
    }
}

#[async_trait]
impl ExchangeApi for RestExchange {
    async fn account_overview(&self) -> EngineResult<AccountOverview> {
        let wire: WireAccount = self
            .request(reqwest::Method::GET, "/api/v1/account-overview", None, false)
            .await?;
        Ok(AccountOverview {
            equity: parse_decimal(&wire.account_equity, "accountEquity")?,
            available_balance: parse_decimal(&wire.available_balance, "availableBalance")?,
        })
    }

    async fn contract_detail(&self, symbol: &str) -> EngineResult<ContractSpec> {
        let path = format!("/api/v1/contracts/{}", symbol);
        let wire: WireContract = self
            .request(reqwest::Method::GET, &path, None, false)
            .await?;
        Ok(ContractSpec {
            symbol: wire.symbol,
            tick_size: parse_decimal(&wire.tick_size, "tickSize")?,
            lot_size: parse_decimal(&wire.lot_size, "lotSize")?,
            multiplier: parse_decimal(&wire.multiplier, "multiplier")?,
            min_order_qty: parse_decimal(&wire.min_order_qty, "minOrderQty")?,
            max_order_qty: parse_decimal(&wire.max_order_qty, "maxOrderQty")?,
            maintenance_margin_percent: parse_decimal(&wire.maintain_margin, "maintainMargin")?
                * Decimal::ONE_HUNDRED,
        })
    }

    async fn place_order(&self, params: &OrderParams) -> EngineResult<OrderAck> {
        let wire: WireOrderAck = self
            .request(
                reqwest::Method::POST,
                "/api/v1/orders",
                Some(Self::order_body(params)),
                true,
            )
            .await?;
        debug!("Placed order {} ({})", wire.order_id, params.client_oid);
        let fill_price = match wire.deal_price {
            Some(raw) => Some(parse_decimal(&raw, "dealPrice")?),
            None => None,
        };
        Ok(OrderAck {
            order_id: wire.order_id,
            fill_price,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> EngineResult<CancelOutcome> {
        let path = format!("/api/v1/orders/{}", order_id);
        match self
            .request::<serde_json::Value>(reqwest::Method::DELETE, &path, None, true)
            .await
        {
            Ok(_) => Ok(CancelOutcome::Canceled),
            Err(EngineError::InvalidOrder { reason, .. }) if reason.contains("not exist") => {
                Ok(CancelOutcome::NotFound)
            }
            Err(EngineError::InvalidOrder { reason, .. }) if reason.contains("filled") => {
                Ok(CancelOutcome::AlreadyFilled)
            }
            Err(e) => Err(e),
        }
    }

    async fn place_stop_order(&self, params: &OrderParams) -> EngineResult<OrderAck> {
        let wire: WireOrderAck = self
            .request(
                reqwest::Method::POST,
                "/api/v1/stopOrders",
                Some(Self::order_body(params)),
                true,
            )
            .await?;
        Ok(OrderAck {
            order_id: wire.order_id,
            fill_price: None,
        })
    }

    async fn cancel_stop_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> EngineResult<CancelOutcome> {
        let path = format!("/api/v1/stopOrders/{}", order_id);
        match self
            .request::<serde_json::Value>(reqwest::Method::DELETE, &path, None, true)
            .await
        {
            Ok(_) => Ok(CancelOutcome::Canceled),
            Err(EngineError::InvalidOrder { reason, .. }) if reason.contains("not exist") => {
                Ok(CancelOutcome::NotFound)
            }
            Err(EngineError::InvalidOrder { reason, .. }) if reason.contains("filled") => {
                Ok(CancelOutcome::AlreadyFilled)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let path = format!("/api/v1/mark-price/{}/current", symbol);
        let wire: WireMark = self
            .request(reqwest::Method::GET, &path, None, false)
            .await?;
        parse_decimal(&wire.value, "mark price")
    }

    async fn open_positions(&self) -> EngineResult<Vec<ExchangePosition>> {
        let wire: Vec<WirePosition> = self
            .request(reqwest::Method::GET, "/api/v1/positions", None, false)
            .await?;
        wire.into_iter()
            .filter_map(|p| {
                let qty = parse_decimal(&p.current_qty, "currentQty").ok()?;
                if qty.is_zero() {
                    return None;
                }
                let side = if qty > Decimal::ZERO {
                    Side::Long
                } else {
                    Side::Short
                };
                Some(Ok(ExchangePosition {
                    symbol: p.symbol,
                    side,
                    size: qty.abs(),
                    entry_price: parse_decimal(&p.avg_entry_price, "avgEntryPrice").ok()?,
                    mark_price: parse_decimal(&p.mark_price, "markPrice").ok()?,
                }))
            })
            .collect()
    }

    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>> {
        let path = format!(
            "/api/v1/kline?symbol={}&granularity={}&limit={}",
            symbol,
            timeframe.to_minutes(),
            limit
        );
        // Rows are [time, open, high, low, close, volume].
        let wire: Vec<Vec<serde_json::Value>> = self
            .request(reqwest::Method::GET, &path, None, false)
            .await?;
        wire.into_iter()
            .map(|row| {
                if row.len() < 6 {
                    return Err(EngineError::invalid_input("short kline row"));
                }
                let timestamp = row[0]
                    .as_i64()
                    .ok_or_else(|| EngineError::invalid_input("bad kline timestamp"))?;
                let number = |value: &serde_json::Value, field: &str| -> EngineResult<Decimal> {
                    match value {
                        serde_json::Value::String(s) => parse_decimal(s, field),
                        serde_json::Value::Number(n) => parse_decimal(&n.to_string(), field),
                        _ => Err(EngineError::invalid_input(format!("bad kline {}", field))),
                    }
                };
                Ok(Candle {
                    timestamp,
                    open: number(&row[1], "open")?,
                    high: number(&row[2], "high")?,
                    low: number(&row[3], "low")?,
                    close: number(&row[4], "close")?,
                    volume: number(&row[5], "volume")?.max(Decimal::ZERO),
                })
            })
            .collect()
    }
}
