//! Test utilities: mock implementations of the collector contract.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::collector::{Collector, CollectorFactory, CollectorStats, SourceConfig};
use crate::error::CollectError;
use crate::task::{Operation, Params, Task};

type ErrorFn = dyn Fn() -> CollectError + Send + Sync;

// ---------------------------------------------------------------------------
// MockCollector
// ---------------------------------------------------------------------------

/// Mock collector with a scripted response queue.
///
/// Each `fetch`/`store` call pops the next scripted response. When the script
/// runs out, the collector either keeps failing (if built with
/// [`failing_with`](Self::failing_with)) or returns the fallback value.
#[derive(Clone)]
pub struct MockCollector {
    script: Arc<Mutex<Vec<Result<serde_json::Value, CollectError>>>>,
    repeat_error: Option<Arc<ErrorFn>>,
    fallback: Arc<serde_json::Value>,
    fetch_calls: Arc<AtomicU64>,
    store_calls: Arc<AtomicU64>,
    stop_calls: Arc<AtomicU64>,
    stop_error: Arc<Mutex<Option<CollectError>>>,
    stats: Arc<Mutex<CollectorStats>>,
}

impl MockCollector {
    fn build(
        script: Vec<Result<serde_json::Value, CollectError>>,
        repeat_error: Option<Arc<ErrorFn>>,
        fallback: serde_json::Value,
    ) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            repeat_error,
            fallback: Arc::new(fallback),
            fetch_calls: Arc::new(AtomicU64::new(0)),
            store_calls: Arc::new(AtomicU64::new(0)),
            stop_calls: Arc::new(AtomicU64::new(0)),
            stop_error: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(CollectorStats::default())),
        }
    }

    /// Always succeeds with the given value.
    pub fn succeeding(value: serde_json::Value) -> Self {
        Self::build(Vec::new(), None, value)
    }

    /// Pops the given responses in order, then falls back to a default value.
    pub fn with_responses(responses: Vec<Result<serde_json::Value, CollectError>>) -> Self {
        Self::build(responses, None, serde_json::json!({"default": true}))
    }

    /// Fails every call with a freshly built error.
    pub fn failing_with(make_error: impl Fn() -> CollectError + Send + Sync + 'static) -> Self {
        Self::build(Vec::new(), Some(Arc::new(make_error)), serde_json::Value::Null)
    }

    /// Make the next `stop` call return this error.
    pub fn set_stop_error(&self, error: CollectError) {
        *self.stop_error.lock().unwrap() = Some(error);
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::Relaxed)
    }

    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::Relaxed)
    }

    fn next_response(&self) -> Result<serde_json::Value, CollectError> {
        let mut script = self.script.lock().unwrap();
        let result = if script.is_empty() {
            match &self.repeat_error {
                Some(make_error) => Err(make_error()),
                None => Ok((*self.fallback).clone()),
            }
        } else {
            script.remove(0)
        };

        let mut stats = self.stats.lock().unwrap();
        stats.requests_made += 1;
        match &result {
            Ok(_) => stats.requests_successful += 1,
            Err(_) => stats.requests_failed += 1,
        }
        result
    }
}

#[async_trait]
impl Collector for MockCollector {
    async fn fetch(&self, _params: &Params) -> Result<serde_json::Value, CollectError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.next_response()
    }

    async fn store(&self, _params: &Params) -> Result<serde_json::Value, CollectError> {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        self.next_response()
    }

    fn stats(&self) -> CollectorStats {
        *self.stats.lock().unwrap()
    }

    async fn stop(&self) -> Result<(), CollectError> {
        self.stop_calls.fetch_add(1, Ordering::Relaxed);
        match self.stop_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCollectorFactory
// ---------------------------------------------------------------------------

/// Factory that hands out clones of one shared [`MockCollector`], so tests
/// can inspect the instance the dispatcher created.
#[derive(Clone)]
pub struct MockCollectorFactory {
    collector: MockCollector,
    create_error: Arc<Mutex<Option<CollectError>>>,
    created: Arc<AtomicU64>,
}

impl MockCollectorFactory {
    pub fn new(collector: MockCollector) -> Self {
        Self {
            collector,
            create_error: Arc::new(Mutex::new(None)),
            created: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn succeeding(value: serde_json::Value) -> Self {
        Self::new(MockCollector::succeeding(value))
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, CollectError>>) -> Self {
        Self::new(MockCollector::with_responses(responses))
    }

    pub fn failing_with(make_error: impl Fn() -> CollectError + Send + Sync + 'static) -> Self {
        Self::new(MockCollector::failing_with(make_error))
    }

    /// Factory whose first `create` call fails.
    pub fn with_create_error(error: CollectError) -> Self {
        let factory = Self::new(MockCollector::succeeding(serde_json::Value::Null));
        *factory.create_error.lock().unwrap() = Some(error);
        factory
    }

    /// The shared collector instance this factory vends.
    pub fn collector(&self) -> MockCollector {
        self.collector.clone()
    }

    pub fn set_stop_error(&self, error: CollectError) {
        self.collector.set_stop_error(error);
    }

    pub fn stop_calls(&self) -> u64 {
        self.collector.stop_calls()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

impl CollectorFactory for MockCollectorFactory {
    fn create(&self, _config: &SourceConfig) -> Result<Arc<dyn Collector>, CollectError> {
        if let Some(e) = self.create_error.lock().unwrap().take() {
            return Err(e);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(self.collector.clone()))
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a pending fetch task against the given source.
pub fn make_test_task(source: &str) -> Task {
    Task::new(source, Operation::Fetch).with_param("season", serde_json::json!(2025))
}
