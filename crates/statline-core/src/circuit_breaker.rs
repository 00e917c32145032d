//! Circuit breaker for failure isolation per endpoint.
//!
//! Stops sending requests to a known-bad endpoint for a cooldown period so
//! one broken source can't soak the whole collection run in timeouts.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (one probe)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::CollectError;

/// Current state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without touching the endpoint.
    Open,
    /// Cooldown elapsed; a single probe is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    /// Whether the half-open probe slot has been handed out.
    probe_admitted: bool,
    last_error_message: Option<String>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            probe_admitted: false,
            last_error_message: None,
        }
    }

    fn time_until_half_open(&self, recovery_timeout: Duration) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        self.last_failure_at.map(|t| {
            let elapsed = t.elapsed();
            if elapsed < recovery_timeout {
                recovery_timeout - elapsed
            } else {
                Duration::ZERO
            }
        })
    }
}

/// Snapshot of one breaker for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker guarding one endpoint.
#[derive(Clone)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner::new())),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(endpoint = %self.endpoint, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_at
            && last_failure.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!(
                endpoint = %self.endpoint,
                "Circuit cooled down, admitting a probe"
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_admitted = false;
        }
    }

    /// Current state, applying the lazy Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now.
    ///
    /// In half-open state exactly one caller gets a `true`; everyone else is
    /// rejected until the probe's outcome is recorded.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_admitted {
                    false
                } else {
                    inner.probe_admitted = true;
                    true
                }
            }
        }
    }

    /// Record the outcome of an admitted call. Must be invoked exactly once
    /// per guarded call, pairing with [`record_failure`](Self::record_failure).
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(endpoint = %self.endpoint, "Probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.probe_admitted = false;
                inner.last_error_message = None;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call, possibly opening the circuit.
    pub fn record_failure(&self, error: &CollectError) {
        let mut inner = self.lock_inner();
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_at = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit opening after consecutive failures"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    error = %error,
                    "Probe failed, reopening circuit"
                );
                inner.state = CircuitState::Open;
                inner.last_failure_at = Some(Instant::now());
                inner.probe_admitted = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open: inner.time_until_half_open(self.config.recovery_timeout),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(endpoint = %self.endpoint, "Circuit manually reset");
        *inner = BreakerInner::new();
    }

    /// The error returned when a call is rejected while the circuit is open.
    ///
    /// Shaped as a server-class error so the retry policy treats a tripped
    /// endpoint like a struggling one: moderate backoff, bounded attempts.
    pub fn open_error(&self) -> CollectError {
        let retry_in = {
            let inner = self.lock_inner();
            inner
                .time_until_half_open(self.config.recovery_timeout)
                .unwrap_or(self.config.recovery_timeout)
        };
        CollectError::Server {
            message: format!(
                "circuit open for '{}', retry in {}s",
                self.endpoint,
                retry_in.as_secs()
            ),
            status: 503,
        }
    }

    /// Execute an operation through the breaker.
    ///
    /// Handles the exactly-once recording contract: success records success,
    /// a tripping error records failure, and a non-tripping error (e.g. a
    /// 404) records success because the endpoint itself answered fine.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CollectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CollectError>>,
    {
        if !self.can_execute() {
            return Err(self.open_error());
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => self.record_success(),
        }
        result
    }
}

/// Constructor-injected map of endpoint → breaker.
///
/// All breakers share one config; unseen endpoints get a fresh closed
/// circuit on first access.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or create) the breaker guarding an endpoint. The returned handle
    /// shares state with every other handle for the same endpoint.
    pub fn breaker(&self, endpoint: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(endpoint, self.config.clone()))
            .clone()
    }

    /// Stats for every endpoint seen so far.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers.values().map(CircuitBreaker::stats).collect()
    }
}
