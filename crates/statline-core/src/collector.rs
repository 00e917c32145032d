//! The uniform capability every source-specific collector implements.
//!
//! The dispatcher only ever sees this contract: an async `fetch`/`store`
//! pair, a stats snapshot, and a `stop` hook. Everything source-specific
//! (HTML tables, per-site JSON shapes) lives behind it, out of the engine's
//! sight.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollectError;
use crate::ratelimit::RateLimiterConfig;
use crate::retry::RetrySchedule;
use crate::task::Params;

/// Request counters every collector exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub requests_made: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
}

/// A source-specific collector, consumed by the dispatcher as an opaque
/// capability.
///
/// Implementations route every network call through the rate limiter and the
/// endpoint's circuit breaker (see `statline-client::GuardedClient`), and are
/// expected to make `stop` idempotent.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Fetch data from the source according to `params`.
    async fn fetch(&self, params: &Params) -> Result<serde_json::Value, CollectError>;

    /// Persist previously fetched content through the source's storage path.
    async fn store(&self, params: &Params) -> Result<serde_json::Value, CollectError>;

    /// Snapshot of this collector's request counters.
    fn stats(&self) -> CollectorStats;

    /// Release resources. Called once per created instance at shutdown.
    async fn stop(&self) -> Result<(), CollectError>;
}

/// Produces a collector instance for one source from its parsed config.
pub trait CollectorFactory: Send + Sync {
    fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Collector>, CollectError>;
}

/// Per-source configuration, consumed as an already-parsed value.
///
/// Loading (YAML, env, whatever) happens outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub dry_run: bool,
}

impl SourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            storage: StorageSettings::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    /// When false the rate stays fixed at `requests_per_second`.
    pub adaptive: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            adaptive: true,
        }
    }
}

impl From<&RateLimitSettings> for RateLimiterConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        let base = RateLimiterConfig::default();
        if settings.adaptive {
            Self {
                initial_rate: settings.requests_per_second,
                max_rate: settings.requests_per_second.max(base.max_rate),
                ..base
            }
        } else {
            // Pin min == max so neither 429s nor success streaks move the rate.
            Self {
                initial_rate: settings.requests_per_second,
                min_rate: settings.requests_per_second,
                max_rate: settings.requests_per_second,
                ..base
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub exponential_backoff: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1.0,
            exponential_backoff: true,
        }
    }
}

impl From<&RetrySettings> for RetrySchedule {
    fn from(settings: &RetrySettings) -> Self {
        let base = std::time::Duration::from_secs_f64(settings.base_delay_secs.max(0.0));
        let schedule = RetrySchedule::new(
            settings.max_attempts.max(1),
            base,
            std::time::Duration::from_secs(300),
        );
        if settings.exponential_backoff {
            schedule
        } else {
            schedule.with_exponential_base(1.0)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    pub bucket: Option<String>,
    pub upload_enabled: bool,
}
