use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use url::Url;

use statline_core::CollectError;
use statline_core::circuit_breaker::CircuitBreakerRegistry;
use statline_core::ratelimit::DomainRateLimiter;

/// HTTP client that routes every request through the admission machinery.
///
/// A `get` first suspends in [`DomainRateLimiter::acquire`] for the target
/// domain, then checks the domain's circuit breaker, and finally maps the
/// HTTP outcome onto the error taxonomy, recording the result with both the
/// limiter and the breaker exactly once. Collectors build on this client so
/// no network call can bypass rate limiting or failure isolation.
#[derive(Clone)]
pub struct GuardedClient {
    client: Client,
    timeout_secs: u64,
    limiter: Arc<DomainRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl GuardedClient {
    pub fn new(
        limiter: Arc<DomainRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, CollectError> {
        Self::with_timeout(limiter, breakers, Duration::from_secs(30))
    }

    pub fn with_timeout(
        limiter: Arc<DomainRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        timeout: Duration,
    ) -> Result<Self, CollectError> {
        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent("statline/0.2 (sports stats collector)")
            .timeout(timeout)
            .build()
            .map_err(|e| CollectError::Configuration(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs,
            limiter,
            breakers,
        })
    }

    /// Fetch a URL's body as text, observing rate limits and the circuit.
    pub async fn get(&self, url: &str) -> Result<String, CollectError> {
        let domain = domain_key(url)?;
        self.limiter.acquire(&domain).await;

        let breaker = self.breakers.breaker(&domain);
        if !breaker.can_execute() {
            // Rejected without a request: nothing to record on the limiter.
            return Err(breaker.open_error());
        }

        let outcome = self.execute(url).await;

        match &outcome {
            Ok(_) => {
                breaker.record_success();
                self.limiter.on_success(&domain).await;
            }
            Err(e) => {
                if let CollectError::RateLimit { retry_after, .. } = e {
                    self.limiter.on_rate_limited(&domain, *retry_after).await;
                } else {
                    self.limiter.on_failure(&domain).await;
                }
                if e.should_trip_circuit() {
                    breaker.record_failure(e);
                } else {
                    breaker.record_success();
                }
            }
        }

        outcome
    }

    /// Fetch a URL and parse the body as JSON.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, CollectError> {
        let body = self.get(url).await?;
        serde_json::from_str(&body)
            .map_err(|e| CollectError::Content(format!("invalid JSON from {url}: {e}")))
    }

    async fn execute(&self, url: &str) -> Result<String, CollectError> {
        tracing::debug!(url = %url, "Fetching");
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                CollectError::Network(format!(
                    "request timed out after {}s: {url}",
                    self.timeout_secs
                ))
            } else if e.is_connect() {
                CollectError::Network(format!("connection failed: {e}"))
            } else {
                CollectError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers());
            return Err(CollectError::RateLimit {
                message: format!("HTTP 429 for {url}"),
                retry_after,
            });
        }
        if status.is_server_error() {
            return Err(CollectError::Server {
                message: format!("HTTP {} for {url}", status.as_u16()),
                status: status.as_u16(),
            });
        }
        if status.is_client_error() {
            return Err(CollectError::Client {
                message: format!("HTTP {} for {url}", status.as_u16()),
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| CollectError::Content(format!("failed to read response body: {e}")))
    }
}

/// Extract the rate-limit/circuit key from a URL (scheme://host:port).
pub fn domain_key(url_str: &str) -> Result<String, CollectError> {
    let url = Url::parse(url_str)
        .map_err(|e| CollectError::Validation(format!("invalid URL '{url_str}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| CollectError::Validation(format!("URL has no host: {url_str}")))?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Ok(format!("{}://{}{}", url.scheme(), host, port))
}

/// Parse a `Retry-After` header in its delay-seconds form.
///
/// The HTTP-date form is rare on the stats sites we pull from and is ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
