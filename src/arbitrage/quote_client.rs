//! Rate-limited, retrying, circuit-broken client for the aggregator's
//! quote API (spec §4.4).
//!
//! The escalating-backoff-over-a-keyed-state pattern is grounded in
//! `cooldown.rs`'s `RouteCooldown`, generalized from a per-route block
//! counter to the single global wall-clock breaker this client needs.

use crate::types::{Asset, ArbError, Quote};
use async_trait::async_trait;
use num_bigint::BigUint;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Raw HTTP boundary the quote client drives. Production code talks to
/// the aggregator over `reqwest`; tests inject a scripted mock so retry
/// and circuit-breaker behavior can be exercised without real I/O.
#[async_trait]
pub trait QuoteTransport: Send + Sync {
    /// Returns the HTTP status code and raw body, or an error for a
    /// connection-level failure (timeout, reset, DNS).
    async fn get(&self, url: &str) -> Result<(u16, String), String>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("failed to build quote HTTP client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl QuoteTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<(u16, String), String> {
        let full = format!("{}{}", self.base_url, url);
        let resp = self
            .client
            .get(&full)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| e.to_string())?;
        Ok((status, body))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

struct RateLimiter {
    last_call: Option<Instant>,
    recent_calls: VecDeque<Instant>,
}

pub struct QuoteClient {
    transport: Box<dyn QuoteTransport>,
    min_interval: Duration,
    max_per_minute: u32,
    circuit_threshold: u32,
    circuit_timeout: Duration,
    rate_limiter: Mutex<RateLimiter>,
    breaker: Mutex<Breaker>,
    queue_depth: AtomicU32,
}

const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20);

impl QuoteClient {
    pub fn new(
        transport: Box<dyn QuoteTransport>,
        min_interval_ms: u64,
        max_per_minute: u32,
        circuit_threshold: u32,
        circuit_timeout_ms: u64,
    ) -> Self {
        Self {
            transport,
            min_interval: Duration::from_millis(min_interval_ms),
            max_per_minute,
            circuit_threshold,
            circuit_timeout: Duration::from_millis(circuit_timeout_ms),
            rate_limiter: Mutex::new(RateLimiter {
                last_call: None,
                recent_calls: VecDeque::new(),
            }),
            breaker: Mutex::new(Breaker {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            queue_depth: AtomicU32::new(0),
        }
    }

    pub async fn quote(
        &self,
        in_asset: &Asset,
        out_asset: &Asset,
        in_amount_raw: &BigUint,
        slippage_bps: u32,
    ) -> Result<Quote, ArbError> {
        let enqueued_at = Instant::now();
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        let result = self
            .quote_inner(in_asset, out_asset, in_amount_raw, slippage_bps, enqueued_at)
            .await;
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn quote_inner(
        &self,
        in_asset: &Asset,
        out_asset: &Asset,
        in_amount_raw: &BigUint,
        slippage_bps: u32,
        enqueued_at: Instant,
    ) -> Result<Quote, ArbError> {
        if !self.try_enter_breaker().await {
            return Err(ArbError::CircuitOpen);
        }

        if !self.wait_for_rate_limit(enqueued_at).await {
            self.record_failure().await;
            return Err(ArbError::Transient("queued longer than 30s".into()));
        }

        let url = format!(
            "/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}&onlyDirectRoutes=false",
            in_asset.address, out_asset.address, in_amount_raw, slippage_bps
        );

        match self.fetch_with_retries(&url).await {
            Ok(quote) => {
                self.record_success().await;
                Ok(quote)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Quote, ArbError> {
        const RATE_LIMIT_BACKOFF: [u64; 3] = [5, 10, 20];
        const TRANSIENT_BACKOFF: [u64; 3] = [3, 6, 9];
        const SERVER_ERROR_BACKOFF: [u64; 3] = [4, 8, 12];

        let mut attempt = 0usize;
        loop {
            let outcome = tokio::time::timeout(PER_ATTEMPT_TIMEOUT, self.transport.get(url)).await;

            let classified = match outcome {
                Err(_) => Classified::Transient("per-attempt timeout".into()),
                Ok(Err(network_err)) => Classified::Transient(network_err),
                Ok(Ok((status, body))) => classify_response(status, &body),
            };

            match classified {
                Classified::Success(quote) => return Ok(quote),
                Classified::Invalid(msg) => return Err(ArbError::QuoteInvalid(msg)),
                Classified::ClientError(msg) => return Err(ArbError::ClientError(msg)),
                Classified::RateLimited if attempt < RATE_LIMIT_BACKOFF.len() => {
                    tokio::time::sleep(Duration::from_secs(RATE_LIMIT_BACKOFF[attempt])).await;
                    attempt += 1;
                }
                Classified::RateLimited => return Err(ArbError::RateLimited),
                Classified::Transient(_) if attempt < TRANSIENT_BACKOFF.len() => {
                    tokio::time::sleep(Duration::from_secs(TRANSIENT_BACKOFF[attempt])).await;
                    attempt += 1;
                }
                Classified::ServerError(_) if attempt < SERVER_ERROR_BACKOFF.len() => {
                    tokio::time::sleep(Duration::from_secs(SERVER_ERROR_BACKOFF[attempt])).await;
                    attempt += 1;
                }
                Classified::Transient(msg) | Classified::ServerError(msg) => {
                    return Err(ArbError::Transient(msg))
                }
            }
        }
    }

    /// Waits for a rate-limit slot, bailing out (without consuming a
    /// slot) once the total time since `enqueued_at` would exceed
    /// `QUEUE_TIMEOUT`. The staleness check happens before a slot is
    /// ever committed, so a request that times out never consumes one
    /// it didn't use. Returns `false` on timeout.
    async fn wait_for_rate_limit(&self, enqueued_at: Instant) -> bool {
        loop {
            let remaining = match QUEUE_TIMEOUT.checked_sub(enqueued_at.elapsed()) {
                Some(r) => r,
                None => return false,
            };

            let wait = {
                let mut limiter = self.rate_limiter.lock().await;
                let now = Instant::now();

                while let Some(&front) = limiter.recent_calls.front() {
                    if now.duration_since(front) > Duration::from_secs(60) {
                        limiter.recent_calls.pop_front();
                    } else {
                        break;
                    }
                }

                let spacing_wait = limiter
                    .last_call
                    .map(|last| self.min_interval.saturating_sub(now.duration_since(last)))
                    .unwrap_or(Duration::ZERO);

                let cap_wait = if limiter.recent_calls.len() as u32 >= self.max_per_minute {
                    let oldest = *limiter.recent_calls.front().unwrap();
                    Duration::from_secs(60).saturating_sub(now.duration_since(oldest))
                } else {
                    Duration::ZERO
                };

                let wait = spacing_wait.max(cap_wait);
                if wait.is_zero() {
                    limiter.last_call = Some(now);
                    limiter.recent_calls.push_back(now);
                    return true;
                }
                wait
            };

            if wait > remaining {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    async fn try_enter_breaker(&self) -> bool {
        let mut breaker = self.breaker.lock().await;
        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.circuit_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    async fn record_failure(&self) {
        let mut breaker = self.breaker.lock().await;
        if breaker.state == BreakerState::HalfOpen {
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Instant::now());
            return;
        }
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.circuit_threshold {
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Instant::now());
        }
    }
}

enum Classified {
    Success(Quote),
    RateLimited,
    Transient(String),
    ServerError(String),
    ClientError(String),
    Invalid(String),
}

fn classify_response(status: u16, body: &str) -> Classified {
    if status == 429 {
        return Classified::RateLimited;
    }
    if (500..600).contains(&status) {
        return Classified::ServerError(format!("server error {status}"));
    }
    if (400..500).contains(&status) {
        return Classified::ClientError(format!("client error {status}"));
    }
    if status != 200 {
        return Classified::Transient(format!("unexpected status {status}"));
    }

    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Classified::Invalid("response body is not valid JSON".into()),
    };

    let in_amount = parsed.get("inAmount").and_then(|v| v.as_str());
    let out_amount = parsed.get("outAmount").and_then(|v| v.as_str());
    let impact = parsed
        .get("priceImpactPct")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let (Some(in_amount), Some(out_amount)) = (in_amount, out_amount) else {
        return Classified::Invalid("missing inAmount/outAmount".into());
    };

    let in_amount = match in_amount.parse::<BigUint>() {
        Ok(v) => v,
        Err(_) => return Classified::Invalid("inAmount is not a valid integer".into()),
    };
    let out_amount = match out_amount.parse::<BigUint>() {
        Ok(v) => v,
        Err(_) => return Classified::Invalid("outAmount is not a valid integer".into()),
    };

    if out_amount == BigUint::from(0u32) {
        return Classified::Invalid("outAmount is zero".into());
    }

    let route_descriptor = parsed
        .get("routePlan")
        .map(|v| v.to_string().into_bytes())
        .unwrap_or_default();

    Classified::Success(Quote {
        in_amount,
        out_amount,
        price_impact_fraction: impact,
        route_descriptor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<(u16, String), String>>>,
        calls: TestCounter,
    }

    #[async_trait]
    impl QuoteTransport for ScriptedTransport {
        async fn get(&self, _url: &str) -> Result<(u16, String), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err("no more scripted responses".into()))
        }
    }

    fn ok_body() -> String {
        r#"{"inAmount":"1000","outAmount":"2000","priceImpactPct":"0.01"}"#.to_string()
    }

    fn asset() -> (Asset, Asset) {
        (Asset::new("mintA", "A", 9), Asset::new("mintB", "B", 6))
    }

    #[tokio::test]
    async fn successful_quote_returns_parsed_fields() {
        let transport = ScriptedTransport {
            responses: Mutex::new(VecDeque::from(vec![Ok((200, ok_body()))])),
            calls: TestCounter::new(0),
        };
        let client = QuoteClient::new(Box::new(transport), 0, 1000, 5, 60_000);
        let (a, b) = asset();
        let quote = client.quote(&a, &b, &BigUint::from(1000u32), 100).await.unwrap();
        assert_eq!(quote.out_amount, BigUint::from(2000u32));
        assert!(quote.is_valid());
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let transport = ScriptedTransport {
            responses: Mutex::new(VecDeque::from(vec![Ok((404, "not found".into()))])),
            calls: TestCounter::new(0),
        };
        let client = QuoteClient::new(Box::new(transport), 0, 1000, 5, 60_000);
        let (a, b) = asset();
        let result = client.quote(&a, &b, &BigUint::from(1000u32), 100).await;
        assert!(matches!(result, Err(ArbError::ClientError(_))));
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let mut responses = VecDeque::new();
        for _ in 0..5 {
            responses.push_back(Ok((500, "err".into())));
        }
        let transport = ScriptedTransport {
            responses: Mutex::new(responses),
            calls: TestCounter::new(0),
        };
        let client = QuoteClient::new(Box::new(transport), 0, 1000, 1, 60_000);
        let (a, b) = asset();

        // First call fails (500 -> exhausts its own retries -> recorded
        // as one consecutive failure against the breaker, which opens
        // immediately since threshold=1).
        let first = client.quote(&a, &b, &BigUint::from(1000u32), 100).await;
        assert!(first.is_err());

        let second = client.quote(&a, &b, &BigUint::from(1000u32), 100).await;
        assert!(matches!(second, Err(ArbError::CircuitOpen)));
    }

    #[tokio::test]
    async fn requests_that_would_wait_past_queue_timeout_are_discarded_without_dispatch() {
        let transport = ScriptedTransport {
            responses: Mutex::new(VecDeque::new()),
            calls: TestCounter::new(0),
        };
        // max_per_minute=1 and a request already occupying the only slot
        // means the next call would need to wait ~60s, far past the 30s
        // queue timeout — it must be discarded, not dispatched, and must
        // never reach the transport.
        let client = QuoteClient::new(Box::new(transport), 0, 1, 5, 60_000);
        {
            let mut limiter = client.rate_limiter.lock().await;
            limiter.last_call = Some(Instant::now());
            limiter.recent_calls.push_back(Instant::now());
        }
        let (a, b) = asset();
        let result = client.quote(&a, &b, &BigUint::from(1000u32), 100).await;
        assert!(matches!(result, Err(ArbError::Transient(_))));
    }

    #[tokio::test]
    async fn rate_limiter_enforces_minimum_spacing() {
        let transport = ScriptedTransport {
            responses: Mutex::new(VecDeque::from(vec![Ok((200, ok_body())), Ok((200, ok_body()))])),
            calls: TestCounter::new(0),
        };
        let client = QuoteClient::new(Box::new(transport), 50, 1000, 5, 60_000);
        let (a, b) = asset();

        let start = Instant::now();
        client.quote(&a, &b, &BigUint::from(1000u32), 100).await.unwrap();
        client.quote(&a, &b, &BigUint::from(1000u32), 100).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
