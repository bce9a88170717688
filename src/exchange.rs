// =============================================================================
// Exchange Adapter — USDT-margined perpetual futures boundary
// =============================================================================
//
// `ExchangeAdapter` is the typed contract the engine core depends on;
// `BinanceFuturesClient` is the one concrete
// implementation shipped here, signing requests the same way the
// predecessor spot client did (HMAC-SHA256 over the query string, API key
// as a header, bounded recv-window) but targeting the USDT-M futures REST
// surface (`/fapi/v1`, `/fapi/v2`) instead of `/api/v3`.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::types::Direction;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Closed error taxonomy at the adapter boundary — callers match on
/// `kind()` to decide retry-next-tick vs abort-to-MONITORING vs
/// close-immediately.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("unknown order: {0}")]
    UnknownOrder(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("other exchange error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Closed,
    Filled,
    Canceled,
    Other,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub average: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub filled_quantity: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub lot_precision: u32,
    pub min_notional: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl From<Direction> for OrderSide {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }
}

/// Options passed to `cancel_order`/`fetch_order` — futures conditional
/// orders (stop-market) live in a separate book from regular orders on
/// most exchanges.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderQueryOptions {
    pub trigger: bool,
}

/// The boundary the engine core consumes. Implementers supply these; the
/// core never reaches past this trait for exchange I/O.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn load_markets(&self) -> Result<(), ExchangeError>;
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError>;
    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;
    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError>;
    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), ExchangeError>;
    async fn market_order(&self, symbol: &str, side: OrderSide, quantity: Decimal) -> Result<OrderResult, ExchangeError>;
    async fn stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderResult, ExchangeError>;
    async fn cancel_order(&self, order_id: &str, symbol: &str, opts: OrderQueryOptions) -> Result<(), ExchangeError>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
    async fn fetch_order(&self, order_id: &str, symbol: &str, opts: OrderQueryOptions) -> Result<OrderResult, ExchangeError>;
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;
}

/// Binance USDT-M perpetual-futures REST client.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesClient initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn classify_error(status: reqwest::StatusCode, body: &serde_json::Value) -> ExchangeError {
        let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let msg = body.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown").to_string();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || code == -1003 {
            return ExchangeError::RateLimited(msg);
        }
        match code {
            -2019 => ExchangeError::InsufficientBalance(msg),
            -2011 | -2013 => ExchangeError::UnknownOrder(msg),
            -1013 | -4003 | -4164 => ExchangeError::InvalidOrder(msg),
            _ if status.is_server_error() => ExchangeError::Network(msg),
            _ => ExchangeError::Other(format!("{status}: {msg}")),
        }
    }

    async fn get(&self, path: &str, query: &str, signed: bool) -> Result<serde_json::Value, ExchangeError> {
        let qs = if signed { self.signed_query(query) } else { query.to_string() };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };
        self.send(self.client.get(&url)).await
    }

    async fn post(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(query);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.post(&url)).await
    }

    async fn delete(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(query);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.delete(&url)).await
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, ExchangeError> {
        let resp = builder.send().await.map_err(|e| ExchangeError::Network(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        Ok(body)
    }

    fn parse_decimal(val: &serde_json::Value) -> Result<Decimal, ExchangeError> {
        if let Some(s) = val.as_str() {
            s.parse::<Decimal>().map_err(|e| ExchangeError::Other(format!("bad decimal '{s}': {e}")))
        } else if let Some(n) = val.as_f64() {
            Decimal::from_f64(n).ok_or_else(|| ExchangeError::Other(format!("cannot represent {n} as Decimal")))
        } else {
            Err(ExchangeError::Other(format!("expected string/number decimal, got {val}")))
        }
    }

    fn parse_order_status(raw: &str) -> OrderStatus {
        match raw {
            "NEW" | "PARTIALLY_FILLED" => OrderStatus::Open,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" | "REJECTED" => OrderStatus::Canceled,
            "CLOSED" => OrderStatus::Closed,
            _ => OrderStatus::Other,
        }
    }
}

/// `kline`/`continuousKlines` interval string per our 15m/1h/4h timeframes.
fn interval_str(timeframe: &str) -> &str {
    timeframe
}

#[derive(Deserialize)]
struct Balance {
    asset: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[async_trait]
impl ExchangeAdapter for BinanceFuturesClient {
    #[instrument(skip(self), name = "exchange::load_markets")]
    async fn load_markets(&self) -> Result<(), ExchangeError> {
        let _ = self.get("/fapi/v1/exchangeInfo", "", false).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::fetch_price")]
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let body = self.get("/fapi/v1/ticker/price", &format!("symbol={symbol}"), false).await?;
        let price = body
            .get("price")
            .ok_or_else(|| ExchangeError::Other("ticker response missing price".to_string()))?;
        Self::parse_decimal(price)
    }

    #[instrument(skip(self), name = "exchange::fetch_ohlcv")]
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError> {
        let interval = interval_str(timeframe);
        let body = self
            .get(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
                false,
            )
            .await?;

        let raw = body.as_array().ok_or_else(|| ExchangeError::Other("klines response is not an array".to_string()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().ok_or_else(|| ExchangeError::Other("kline entry is not an array".to_string()))?;
            if arr.len() < 7 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_decimal(&arr[1])?.to_f64().unwrap_or(0.0);
            let high = Self::parse_decimal(&arr[2])?.to_f64().unwrap_or(0.0);
            let low = Self::parse_decimal(&arr[3])?.to_f64().unwrap_or(0.0);
            let close = Self::parse_decimal(&arr[4])?.to_f64().unwrap_or(0.0);
            let volume = Self::parse_decimal(&arr[5])?.to_f64().unwrap_or(0.0);
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }

        debug!(symbol, interval, count = candles.len(), "OHLCV fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "exchange::fetch_balance")]
    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let body = self.get("/fapi/v2/balance", "", true).await?;
        let balances: Vec<Balance> = serde_json::from_value(body).map_err(|e| ExchangeError::Other(e.to_string()))?;
        for b in balances {
            if b.asset == asset {
                return b
                    .available_balance
                    .parse::<Decimal>()
                    .map_err(|e| ExchangeError::Other(e.to_string()));
            }
        }
        warn!(asset, "asset not found in futures balances — returning 0");
        Ok(Decimal::ZERO)
    }

    #[instrument(skip(self), name = "exchange::fetch_positions")]
    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self.get("/fapi/v2/positionRisk", &params, true).await?;
        let raw = body.as_array().ok_or_else(|| ExchangeError::Other("positionRisk response is not an array".to_string()))?;

        let mut positions = Vec::new();
        for entry in raw {
            let amt = entry.get("positionAmt").and_then(|v| Self::parse_decimal(v).ok()).unwrap_or(Decimal::ZERO);
            if amt == Decimal::ZERO {
                continue;
            }
            let sym = entry.get("symbol").and_then(|s| s.as_str()).unwrap_or_default().to_string();
            let entry_price = entry.get("entryPrice").and_then(|v| Self::parse_decimal(v).ok()).unwrap_or(Decimal::ZERO);
            positions.push(ExchangePosition {
                symbol: sym,
                direction: if amt > Decimal::ZERO { Direction::Long } else { Direction::Short },
                quantity: amt.abs(),
                entry_price,
            });
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "exchange::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.post("/fapi/v1/leverage", &format!("symbol={symbol}&leverage={leverage}")).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::set_margin_mode")]
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        let mode_str = match mode {
            MarginMode::Cross => "CROSSED",
            MarginMode::Isolated => "ISOLATED",
        };
        match self.post("/fapi/v1/marginType", &format!("symbol={symbol}&marginType={mode_str}")).await {
            Ok(_) => Ok(()),
            // Binance reports -4046 "No need to change margin type" — treat as success.
            Err(ExchangeError::Other(ref msg)) if msg.contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "exchange::set_position_mode")]
    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), ExchangeError> {
        let dual = match mode {
            PositionMode::OneWay => "false",
            PositionMode::Hedge => "true",
        };
        match self.post("/fapi/v1/positionSide/dual", &format!("dualSidePosition={dual}")).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Other(ref msg)) if msg.contains("-4059") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "exchange::market_order")]
    async fn market_order(&self, symbol: &str, side: OrderSide, quantity: Decimal) -> Result<OrderResult, ExchangeError> {
        let params = format!("symbol={symbol}&side={}&type=MARKET&quantity={quantity}", side.as_str());
        let body = self.post("/fapi/v1/order", &params).await?;
        Self::order_result_from_json(&body)
    }

    #[instrument(skip(self), name = "exchange::stop_market_order")]
    async fn stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let params = format!(
            "symbol={symbol}&side={}&type=STOP_MARKET&quantity={quantity}&stopPrice={stop_price}&reduceOnly=true",
            side.as_str()
        );
        let body = self.post("/fapi/v1/order", &params).await?;
        Self::order_result_from_json(&body)
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(&self, order_id: &str, symbol: &str, _opts: OrderQueryOptions) -> Result<(), ExchangeError> {
        match self.delete("/fapi/v1/order", &format!("symbol={symbol}&orderId={order_id}")).await {
            Ok(_) => Ok(()),
            // Order-not-found is success-equivalent.
            Err(ExchangeError::UnknownOrder(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "exchange::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        match self.delete("/fapi/v1/allOpenOrders", &format!("symbol={symbol}")).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::UnknownOrder(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "exchange::fetch_order")]
    async fn fetch_order(&self, order_id: &str, symbol: &str, _opts: OrderQueryOptions) -> Result<OrderResult, ExchangeError> {
        let body = self.get("/fapi/v1/order", &self.signed_query(&format!("symbol={symbol}&orderId={order_id}")), false).await?;
        Self::order_result_from_json(&body)
    }

    #[instrument(skip(self), name = "exchange::symbol_filters")]
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let body = self.get("/fapi/v1/exchangeInfo", &format!("symbol={symbol}"), false).await?;
        let info = body
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| ExchangeError::Other("symbol not found in exchangeInfo".to_string()))?;

        let quantity_precision = info.get("quantityPrecision").and_then(|p| p.as_u64()).unwrap_or(3) as u32;

        let min_notional = info
            .get("filters")
            .and_then(|f| f.as_array())
            .and_then(|filters| filters.iter().find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("MIN_NOTIONAL")))
            .and_then(|f| f.get("notional"))
            .and_then(|n| Self::parse_decimal(n).ok())
            .unwrap_or_else(|| Decimal::from(5));

        Ok(SymbolFilters {
            lot_precision: quantity_precision,
            min_notional,
        })
    }
}

impl BinanceFuturesClient {
    fn order_result_from_json(body: &serde_json::Value) -> Result<OrderResult, ExchangeError> {
        let order_id = body
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let status_raw = body.get("status").and_then(|s| s.as_str()).unwrap_or("NEW");
        let average = body.get("avgPrice").and_then(|v| Self::parse_decimal(v).ok()).filter(|d| *d != Decimal::ZERO);
        let price = body.get("price").and_then(|v| Self::parse_decimal(v).ok());
        let stop_price = body.get("stopPrice").and_then(|v| Self::parse_decimal(v).ok());
        let filled_quantity = body.get("executedQty").and_then(|v| Self::parse_decimal(v).ok()).unwrap_or(Decimal::ZERO);

        Ok(OrderResult {
            order_id,
            status: Self::parse_order_status(status_raw),
            average,
            price,
            stop_price,
            filled_quantity,
        })
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_side_from_direction() {
        assert_eq!(OrderSide::from(Direction::Long).as_str(), "BUY");
        assert_eq!(OrderSide::from(Direction::Short).as_str(), "SELL");
    }

    #[test]
    fn parse_order_status_maps_known_values() {
        assert!(matches!(BinanceFuturesClient::parse_order_status("FILLED"), OrderStatus::Filled));
        assert!(matches!(BinanceFuturesClient::parse_order_status("CANCELED"), OrderStatus::Canceled));
        assert!(matches!(BinanceFuturesClient::parse_order_status("bogus"), OrderStatus::Other));
    }

    #[test]
    fn classify_error_maps_insufficient_balance_code() {
        let body = serde_json::json!({ "code": -2019, "msg": "Margin is insufficient" });
        let err = BinanceFuturesClient::classify_error(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, ExchangeError::InsufficientBalance(_)));
    }

    #[test]
    fn classify_error_maps_rate_limit() {
        let body = serde_json::json!({ "code": -1003, "msg": "Too many requests" });
        let err = BinanceFuturesClient::classify_error(reqwest::StatusCode::TOO_MANY_REQUESTS, &body);
        assert!(matches!(err, ExchangeError::RateLimited(_)));
    }
}
