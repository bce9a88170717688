// =============================================================================
// Advisory Adapter — remote market-snapshot scoring, never load-bearing
// =============================================================================
//
// No direct teacher analog existed for this boundary; the request/response
// plumbing (reqwest client, `#[instrument]`, structured error logging) is
// grounded on the HMAC client idiom in `exchange.rs`. A timeout or
// malformed response MUST resolve to `AdvisoryOpinion::sentinel()`, never
// a propagated error — the evaluator only ever sees "no advisory" or "an
// opinion".
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{instrument, warn};

use crate::types::{AdvisoryOpinion, IndicatorSnapshot};

const REQUEST_TIMEOUT_SECS: u64 = 8;
const CACHE_BUCKET_MINUTES: i64 = 10;

#[async_trait]
pub trait AdvisoryAdapter: Send + Sync {
    async fn analyze(&self, snapshot: &MarketSnapshot) -> AdvisoryOpinion;
}

/// Structured market snapshot sent to the advisory endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub indicators: IndicatorSnapshot,
}

/// HTTP-backed advisory client with `(symbol, 10-minute bucket)` caching
/// to respect upstream rate limits.
pub struct HttpAdvisoryClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
    cache: Mutex<HashMap<(String, i64), AdvisoryOpinion>>,
}

impl HttpAdvisoryClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            endpoint: endpoint.into(),
            api_key,
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(now_ms: i64) -> i64 {
        now_ms / (CACHE_BUCKET_MINUTES * 60_000)
    }

    async fn query(&self, snapshot: &MarketSnapshot) -> anyhow::Result<AdvisoryOpinion> {
        let mut req = self.client.post(&self.endpoint).json(snapshot);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let opinion: AdvisoryOpinion = resp.error_for_status()?.json().await?;
        Ok(opinion)
    }
}

#[async_trait]
impl AdvisoryAdapter for HttpAdvisoryClient {
    #[instrument(skip(self, snapshot), fields(symbol = %snapshot.symbol))]
    async fn analyze(&self, snapshot: &MarketSnapshot) -> AdvisoryOpinion {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let key = (snapshot.symbol.clone(), Self::bucket(now_ms));

        if let Some(cached) = self.cache.lock().get(&key) {
            return cached.clone();
        }

        let opinion = match self.query(snapshot).await {
            Ok(opinion) => opinion,
            Err(err) => {
                warn!(error = %err, symbol = %snapshot.symbol, "advisory call failed — returning sentinel");
                AdvisoryOpinion::sentinel()
            }
        };

        self.cache.lock().insert(key, opinion.clone());
        opinion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_groups_timestamps_within_ten_minutes() {
        let base = 1_700_000_000_000_i64;
        let b1 = HttpAdvisoryClient::bucket(base);
        let b2 = HttpAdvisoryClient::bucket(base + 5 * 60_000);
        let b3 = HttpAdvisoryClient::bucket(base + 11 * 60_000);
        assert_eq!(b1, b2);
        assert_ne!(b1, b3);
    }

    #[tokio::test]
    async fn analyze_returns_sentinel_on_unreachable_endpoint() {
        let client = HttpAdvisoryClient::new("http://127.0.0.1:1/advisory", None);
        let snapshot = MarketSnapshot {
            symbol: "BTC/USDT".to_string(),
            price: 50000.0,
            indicators: IndicatorSnapshot {
                ema20: 49950.0,
                ema30: 49900.0,
                ema60: 49500.0,
                rsi14: 52.0,
                atr14: 200.0,
                adx15m: 30.0,
                adx1h: 28.0,
                adx4h: 30.0,
            },
        };
        let opinion = client.analyze(&snapshot).await;
        assert!(opinion.direction.is_none());
        assert_eq!(opinion.confidence, 0.0);
    }
}
