//! Rate-limited, retrying transport to the upstream performance API.
//!
//! [`Backend`] performs one raw POST and classifies the outcome.
//! [`RateLimitedTransport`] wraps a backend with the shared minimum-interval
//! limiter, a per-call timeout and bounded retry with backoff.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ApiConfig, TransportConfig};
use crate::error::{TransportError, truncate_body};
use crate::rate_limit::MinIntervalLimiter;
use crate::retry::{RetryPolicy, with_retry_outcome};

/// Upstream endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ServiceMetrics,
    ServiceDetails,
}

impl Endpoint {
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::ServiceMetrics => "serviceMetrics",
            Self::ServiceDetails => "serviceDetails",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// One outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub endpoint: Endpoint,
    pub payload: Value,
    pub timeout: Duration,
}

/// Raw request execution. Implementations do not retry or throttle.
pub trait Backend: Send + Sync {
    fn send(&self, request: &Request) -> impl Future<Output = Result<Value, TransportError>> + Send;
}

/// reqwest-backed [`Backend`] with a pooled client.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Build a backend, reading the API key from `api.key_env`.
    pub fn from_env(api: &ApiConfig) -> Result<Self, TransportError> {
        let key = std::env::var(&api.key_env).map_err(|_| {
            TransportError::Setup(format!("environment variable {} is not set", api.key_env))
        })?;
        Self::new(api, &key)
    }

    pub fn new(api: &ApiConfig, api_key: &str) -> Result<Self, TransportError> {
        if api_key.trim().is_empty() {
            return Err(TransportError::Setup("API key is empty".to_string()));
        }
        let mut key = HeaderValue::from_str(api_key.trim())
            .map_err(|e| TransportError::Setup(format!("invalid API key header: {e}")))?;
        key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("x-apikey", key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(api.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url, endpoint.path())
    }
}

impl Backend for HttpBackend {
    async fn send(&self, request: &Request) -> Result<Value, TransportError> {
        let endpoint = request.endpoint.path().to_string();
        let response = self
            .client
            .post(self.url(request.endpoint))
            .json(&request.payload)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&endpoint, request.timeout, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&endpoint, request.timeout, &e))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint,
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|_| TransportError::InvalidBody {
            endpoint,
            body: truncate_body(&body),
        })
    }
}

fn classify_reqwest_error(endpoint: &str, timeout: Duration, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    } else {
        TransportError::Connect {
            endpoint: endpoint.to_string(),
            message: truncate_body(&err.to_string()),
        }
    }
}

/// Outbound call accounting, readable while calls are in flight.
#[derive(Debug, Default)]
pub struct TransportStats {
    calls: AtomicU64,
    hostile: AtomicU64,
}

impl TransportStats {
    /// Attempts sent to the backend, retries included.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Attempts answered with 403 or 429.
    #[must_use]
    pub fn hostile_responses(&self) -> u64 {
        self.hostile.load(Ordering::Relaxed)
    }
}

/// Throttled, retrying wrapper shared by every call site of a run.
#[derive(Debug)]
pub struct RateLimitedTransport<B> {
    backend: B,
    limiter: MinIntervalLimiter,
    policy: RetryPolicy,
    stats: TransportStats,
}

impl<B: Backend> RateLimitedTransport<B> {
    #[must_use]
    pub fn new(backend: B, limiter: MinIntervalLimiter, policy: RetryPolicy) -> Self {
        Self {
            backend,
            limiter,
            policy,
            stats: TransportStats::default(),
        }
    }

    #[must_use]
    pub fn from_config(backend: B, config: &TransportConfig) -> Self {
        Self::new(
            backend,
            MinIntervalLimiter::new(Duration::from_millis(config.min_interval_ms)),
            RetryPolicy::from_config(config),
        )
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `payload` to `endpoint`, retrying transient failures.
    ///
    /// Every attempt, retries included, waits for the shared limiter.
    pub async fn call(
        &self,
        endpoint: Endpoint,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let request = Request {
            endpoint,
            payload,
            timeout,
        };
        let outcome = with_retry_outcome(&self.policy, TransportError::is_retryable, || {
            self.attempt(&request)
        })
        .await;

        if let Err(err) = &outcome.result {
            warn!(
                endpoint = %endpoint,
                attempts = outcome.attempts,
                status = ?err.status(),
                error = %err,
                "upstream call failed"
            );
        } else {
            debug!(
                endpoint = %endpoint,
                attempts = outcome.attempts,
                elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
                "upstream call succeeded"
            );
        }
        outcome.result
    }

    async fn attempt(&self, request: &Request) -> Result<Value, TransportError> {
        self.limiter.acquire().await;
        self.stats.calls.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(request.timeout, self.backend.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                endpoint: request.endpoint.path().to_string(),
                timeout_secs: request.timeout.as_secs(),
            }),
        };

        if let Err(err) = &result {
            if err.is_hostile() {
                self.stats.hostile.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    fn transport(replies: Vec<Reply>) -> RateLimitedTransport<ScriptedBackend> {
        RateLimitedTransport::new(
            ScriptedBackend::new(replies),
            MinIntervalLimiter::new(Duration::from_millis(500)),
            RetryPolicy::default(),
        )
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn success_passes_through() {
        let t = transport(vec![Reply::Ok(json!({"Services": []}))]);
        let value = t
            .call(Endpoint::ServiceMetrics, json!({}), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(value, json!({"Services": []}));
        assert_eq!(t.stats().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_status_is_retried() {
        let t = transport(vec![status(503), status(502), Reply::Ok(json!(1))]);
        let start = tokio::time::Instant::now();
        let value = t
            .call(Endpoint::ServiceMetrics, json!({}), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(t.stats().calls(), 3);
        // 1s + 2s base backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried() {
        let t = transport(vec![status(400), Reply::Ok(json!(1))]);
        let err = t
            .call(Endpoint::ServiceMetrics, json!({}), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(t.stats().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_three_retries() {
        let t = transport(vec![status(504), status(504), status(504), status(504), status(504)]);
        let err = t
            .call(Endpoint::ServiceMetrics, json!({}), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(504));
        assert_eq!(t.stats().calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_becomes_timeout() {
        let t = transport(vec![Reply::Hang, Reply::Ok(json!(2))]);
        let value = t
            .call(Endpoint::ServiceDetails, json!({"rid": "1"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(t.stats().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hostile_responses_are_counted() {
        let t = transport(vec![status(429), status(403)]);
        let err = t
            .call(Endpoint::ServiceMetrics, json!({}), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(t.stats().hostile_responses(), 2);
    }

    #[test]
    fn http_backend_rejects_empty_key() {
        let err = HttpBackend::new(&ApiConfig::default(), "  ").unwrap_err();
        assert!(matches!(err, TransportError::Setup(_)));
    }

    #[test]
    fn http_backend_builds_endpoint_urls() {
        let api = ApiConfig {
            base_url: "https://example.test/api/v1/".to_string(),
            ..ApiConfig::default()
        };
        let backend = HttpBackend::new(&api, "secret").unwrap();
        assert_eq!(
            backend.url(Endpoint::ServiceDetails),
            "https://example.test/api/v1/serviceDetails"
        );
    }
}
