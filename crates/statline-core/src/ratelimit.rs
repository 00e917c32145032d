//! Adaptive per-domain admission control for polite collection.
//!
//! Each domain gets an independent token bucket whose refill rate adapts to
//! how the source responds: a 429 halves the rate (floored at `min_rate`) and
//! honors any `Retry-After` window, a sustained run of successes nudges the
//! rate back up toward `max_rate`. `acquire` suspends the caller until a
//! token is available (it never denies outright), and a caller waiting on
//! one domain never delays requests to a different domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Tuning knobs for every domain bucket.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Starting refill rate, in requests per second.
    pub initial_rate: f64,
    /// Hard floor the rate never drops below.
    pub min_rate: f64,
    /// Hard ceiling the rate never exceeds.
    pub max_rate: f64,
    /// Consecutive successes required before the rate is raised.
    pub success_streak: u32,
    /// Multiplicative step applied on each raise.
    pub increase_factor: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_rate: 2.0,
            min_rate: 0.1,
            max_rate: 10.0,
            success_streak: 20,
            increase_factor: 1.1,
        }
    }
}

impl RateLimiterConfig {
    /// Clamp the configured rates into a sane, non-zero ordering.
    fn normalized(mut self) -> Self {
        if self.min_rate <= 0.0 {
            self.min_rate = 0.01;
        }
        if self.max_rate < self.min_rate {
            self.max_rate = self.min_rate;
        }
        self.initial_rate = self.initial_rate.clamp(self.min_rate, self.max_rate);
        if self.increase_factor < 1.0 {
            self.increase_factor = 1.0;
        }
        self
    }
}

/// Health of a domain as seen by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterState {
    /// Running at or above the configured initial rate.
    Normal,
    /// Backed off below the initial rate, recovering.
    Degraded,
    /// The source signalled 429 and the rate was just cut.
    RateLimited,
}

impl std::fmt::Display for LimiterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimiterState::Normal => write!(f, "normal"),
            LimiterState::Degraded => write!(f, "degraded"),
            LimiterState::RateLimited => write!(f, "rate-limited"),
        }
    }
}

/// Read-only view of one domain's limiter state.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub current_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub consecutive_429s: u32,
    pub consecutive_successes: u32,
    pub state: LimiterState,
    pub last_adjustment_at: Option<Instant>,
}

/// Per-domain token bucket plus adaptation counters.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    current_rate: f64,
    consecutive_429s: u32,
    consecutive_successes: u32,
    state: LimiterState,
    /// Server-imposed wait; admission is held until it passes.
    penalty_until: Option<Instant>,
    last_adjustment_at: Option<Instant>,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        Self {
            tokens: capacity_for(rate),
            last_refill: Instant::now(),
            current_rate: rate,
            consecutive_429s: 0,
            consecutive_successes: 0,
            state: LimiterState::Normal,
            penalty_until: None,
            last_adjustment_at: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.current_rate).min(capacity_for(self.current_rate));
        self.last_refill = now;
    }
}

/// Burst headroom: up to one second of tokens, never less than one.
fn capacity_for(rate: f64) -> f64 {
    rate.max(1.0)
}

/// Rate limiter keyed by domain.
///
/// The registry lock is held only long enough to look up or insert a bucket;
/// waiting for a token holds the bucket's own lock, so concurrent acquirers
/// of the same domain queue fairly while other domains proceed untouched.
pub struct DomainRateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl DomainRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config: config.normalized(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    async fn bucket(&self, domain: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(self.config.initial_rate))))
            .clone()
    }

    /// Suspend until the domain admits one request.
    ///
    /// Honors a pending `Retry-After` penalty as the enforced minimum delay
    /// before token accounting resumes.
    pub async fn acquire(&self, domain: &str) {
        let bucket = self.bucket(domain).await;
        let mut b = bucket.lock().await;

        loop {
            if let Some(until) = b.penalty_until {
                let now = Instant::now();
                if now < until {
                    let wait = until - now;
                    tracing::debug!(
                        domain = %domain,
                        wait_ms = %wait.as_millis(),
                        "Holding for Retry-After window"
                    );
                    tokio::time::sleep(wait).await;
                }
                b.penalty_until = None;
                // Penalty time doesn't accrue tokens.
                b.last_refill = Instant::now();
            }

            b.refill();
            if b.tokens >= 1.0 {
                b.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - b.tokens) / b.current_rate);
            tracing::debug!(
                domain = %domain,
                wait_ms = %wait.as_millis(),
                rate = b.current_rate,
                "Throttling request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a throttling response: halve the rate (floored at `min_rate`)
    /// and remember the server's requested wait, if any.
    pub async fn on_rate_limited(&self, domain: &str, retry_after: Option<Duration>) {
        let bucket = self.bucket(domain).await;
        let mut b = bucket.lock().await;

        b.consecutive_429s += 1;
        b.consecutive_successes = 0;
        let old_rate = b.current_rate;
        b.current_rate = (b.current_rate / 2.0).max(self.config.min_rate);
        b.state = LimiterState::RateLimited;
        b.last_adjustment_at = Some(Instant::now());
        if let Some(wait) = retry_after {
            b.penalty_until = Some(Instant::now() + wait);
        }

        tracing::warn!(
            domain = %domain,
            old_rate,
            new_rate = b.current_rate,
            consecutive_429s = b.consecutive_429s,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Rate limited, backing off"
        );
    }

    /// Record a successful response. After `success_streak` in a row the rate
    /// is raised one multiplicative step toward `max_rate`.
    pub async fn on_success(&self, domain: &str) {
        let bucket = self.bucket(domain).await;
        let mut b = bucket.lock().await;

        b.consecutive_429s = 0;
        b.consecutive_successes += 1;
        if b.consecutive_successes >= self.config.success_streak {
            b.consecutive_successes = 0;
            let old_rate = b.current_rate;
            b.current_rate = (b.current_rate * self.config.increase_factor).min(self.config.max_rate);
            b.state = if b.current_rate >= self.config.initial_rate {
                LimiterState::Normal
            } else {
                LimiterState::Degraded
            };
            b.last_adjustment_at = Some(Instant::now());
            if b.current_rate > old_rate {
                tracing::info!(
                    domain = %domain,
                    old_rate,
                    new_rate = b.current_rate,
                    state = %b.state,
                    "Raising rate after sustained success"
                );
            }
        }
    }

    /// Record a non-429 failure. The rate is untouched; only the success
    /// streak resets so a flaky source doesn't earn a raise.
    pub async fn on_failure(&self, domain: &str) {
        let bucket = self.bucket(domain).await;
        let mut b = bucket.lock().await;
        b.consecutive_successes = 0;
    }

    /// Current state for a domain, if it has been seen.
    pub async fn snapshot(&self, domain: &str) -> Option<RateLimitState> {
        let buckets = self.buckets.lock().await;
        let bucket = buckets.get(domain)?.clone();
        drop(buckets);

        let b = bucket.lock().await;
        Some(RateLimitState {
            current_rate: b.current_rate,
            min_rate: self.config.min_rate,
            max_rate: self.config.max_rate,
            consecutive_429s: b.consecutive_429s,
            consecutive_successes: b.consecutive_successes,
            state: b.state,
            last_adjustment_at: b.last_adjustment_at,
        })
    }
}
