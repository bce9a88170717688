// =============================================================================
// Price Stream Adapter — websocket mark-price feed with a TTL cache
// =============================================================================
//
// A websocket loop (connect, split, `StreamExt::next` read loop, return
// on disconnect for the caller to decide reconnection) with a "retry in
// N seconds" pattern, generalized here into a bounded exponential backoff
// around the `PriceStreamAdapter` contract.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

const CACHE_TTL_MS: i64 = 5_000;
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct CachedPrice {
    pub price: Decimal,
    pub timestamp_ms: i64,
}

/// Callback invoked on every price tick; must be non-blocking per the
/// contract — we only ever write a cache entry from it, never do I/O.
pub type PriceCallback = Arc<dyn Fn(&str, Decimal, i64) + Send + Sync>;

pub trait PriceStreamAdapter: Send + Sync {
    fn subscribe(&self, symbols: &[String], callback: PriceCallback);
    fn get_cached_price(&self, symbol: &str) -> Option<CachedPrice>;
    fn disconnect(&self);
}

/// Binance mark-price websocket stream (`!markPrice@arr` combined stream),
/// with an in-memory TTL cache and bounded-exponential-backoff reconnect.
pub struct BinanceMarkPriceStream {
    cache: RwLock<HashMap<String, CachedPrice>>,
    shutdown: Arc<Notify>,
}

impl Default for BinanceMarkPriceStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceMarkPriceStream {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn record(&self, symbol: &str, price: Decimal, ts: i64) {
        self.cache.write().insert(
            symbol.to_string(),
            CachedPrice {
                price,
                timestamp_ms: ts,
            },
        );
    }

    /// Drive the reconnect loop until `disconnect()` is called. Intended to
    /// be spawned as a background task by `main.rs`.
    pub async fn run(self: Arc<Self>, symbols: Vec<String>, callback: PriceCallback) {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("price stream shutdown requested");
                    return;
                }
                result = self.connect_and_read(&symbols, &callback) => {
                    match result {
                        Ok(()) => {
                            warn!("price stream ended cleanly — reconnecting");
                            backoff = INITIAL_BACKOFF_SECS;
                        }
                        Err(err) => {
                            error!(error = %err, backoff_secs = backoff, "price stream error — reconnecting with backoff");
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.notified() => return,
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn connect_and_read(&self, symbols: &[String], callback: &PriceCallback) -> anyhow::Result<()> {
        let url = "wss://fstream.binance.com/ws/!markPrice@arr@1s";
        info!(%url, symbols = ?symbols, "connecting to mark-price stream");

        let (ws_stream, _response) = connect_async(url).await?;
        info!("mark-price stream connected");
        let (_write, mut read) = ws_stream.split();

        let wanted: std::collections::HashSet<&str> = symbols.iter().map(|s| s.as_str()).collect();

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    for (symbol, price) in parse_mark_price_array(&text) {
                        if !wanted.is_empty() && !wanted.contains(symbol.as_str()) {
                            continue;
                        }
                        let ts = Self::now_ms();
                        self.record(&symbol, price, ts);
                        callback(&symbol, price, ts);
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    warn!("mark-price stream ended");
                    return Ok(());
                }
            }
        }
    }
}

impl PriceStreamAdapter for BinanceMarkPriceStream {
    fn subscribe(&self, _symbols: &[String], _callback: PriceCallback) {
        // Subscription happens at connect time via `run`; this method
        // exists to satisfy the trait contract for adapters that support
        // dynamic resubscription without a reconnect.
    }

    fn get_cached_price(&self, symbol: &str) -> Option<CachedPrice> {
        let cached = *self.cache.read().get(symbol)?;
        if Self::now_ms() - cached.timestamp_ms > CACHE_TTL_MS {
            return None;
        }
        Some(cached)
    }

    fn disconnect(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Parse a Binance `!markPrice@arr` payload: a JSON array of `{s, p, ...}`.
fn parse_mark_price_array(text: &str) -> Vec<(String, Decimal)> {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let Some(entries) = root.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let symbol = entry.get("s")?.as_str()?.to_string();
            let price_str = entry.get("p")?.as_str()?;
            let price = price_str.parse::<Decimal>().ok().or_else(|| Decimal::from_f64(price_str.parse::<f64>().ok()?))?;
            Some((symbol, price))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cached_price_expires_after_ttl() {
        let stream = BinanceMarkPriceStream::new();
        stream.record("BTCUSDT", dec!(50000), BinanceMarkPriceStream::now_ms() - CACHE_TTL_MS - 1);
        assert!(stream.get_cached_price("BTCUSDT").is_none());
    }

    #[test]
    fn cached_price_is_returned_within_ttl() {
        let stream = BinanceMarkPriceStream::new();
        stream.record("BTCUSDT", dec!(50000), BinanceMarkPriceStream::now_ms());
        let cached = stream.get_cached_price("BTCUSDT").expect("should be cached");
        assert_eq!(cached.price, dec!(50000));
    }

    #[test]
    fn missing_symbol_has_no_cached_price() {
        let stream = BinanceMarkPriceStream::new();
        assert!(stream.get_cached_price("ETHUSDT").is_none());
    }

    #[test]
    fn parse_mark_price_array_extracts_symbol_and_price() {
        let payload = r#"[{"e":"markPriceUpdate","s":"BTCUSDT","p":"50123.40"},{"e":"markPriceUpdate","s":"ETHUSDT","p":"3000.10"}]"#;
        let parsed = parse_mark_price_array(payload);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "BTCUSDT");
        assert_eq!(parsed[0].1, dec!(50123.40));
    }

    #[test]
    fn parse_mark_price_array_returns_empty_on_malformed_json() {
        assert!(parse_mark_price_array("not json").is_empty());
    }
}
