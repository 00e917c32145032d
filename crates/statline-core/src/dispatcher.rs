//! Task routing with a bounded, failure-class-aware retry loop.
//!
//! The dispatcher owns the collector registry, resolves each task's source to
//! a collector instance, runs the requested operation, and applies the retry
//! policy per error category. Attempts within one task are strictly
//! sequential; tasks in a batch fan out concurrently with no ordering
//! guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::collector::{Collector, CollectorFactory, SourceConfig};
use crate::error::{CollectError, Severity};
use crate::retry::RetryPolicy;
use crate::task::{Operation, Task, TaskStatus};

/// Aggregate dispatch counters, readable at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherStats {
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    /// Completed / dispatched; 0.0 before the first dispatch.
    pub success_rate: f64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

struct Registration {
    factory: Arc<dyn CollectorFactory>,
    config: SourceConfig,
}

/// Registry of collectors plus the execution loop that drives them.
///
/// Registrations happen at startup (`&mut self`); dispatching is `&self` and
/// safe to fan out across tasks. Collector instances are created lazily on
/// first use and cached so [`shutdown`](Self::shutdown) can stop each one.
pub struct Dispatcher {
    registrations: HashMap<String, Registration>,
    instances: Mutex<HashMap<String, Arc<dyn Collector>>>,
    retry_policy: RetryPolicy,
    counters: Counters,
    started_at: Instant,
    shut_down: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            registrations: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
            retry_policy,
            counters: Counters::default(),
            started_at: Instant::now(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a collector factory for a source name.
    ///
    /// Re-registering an existing source is a configuration error; replacing
    /// a registration must be explicit via
    /// [`register_override`](Self::register_override).
    pub fn register(
        &mut self,
        source: impl Into<String>,
        factory: Arc<dyn CollectorFactory>,
        config: SourceConfig,
    ) -> Result<(), CollectError> {
        let source = source.into();
        if source.is_empty() {
            return Err(CollectError::Configuration(
                "source name must not be empty".into(),
            ));
        }
        if self.registrations.contains_key(&source) {
            return Err(CollectError::Configuration(format!(
                "source '{source}' is already registered; use register_override to replace it"
            )));
        }
        self.registrations
            .insert(source, Registration { factory, config });
        Ok(())
    }

    /// Replace (or add) a registration, dropping any cached instance.
    pub fn register_override(
        &mut self,
        source: impl Into<String>,
        factory: Arc<dyn CollectorFactory>,
        config: SourceConfig,
    ) -> Result<(), CollectError> {
        let source = source.into();
        if source.is_empty() {
            return Err(CollectError::Configuration(
                "source name must not be empty".into(),
            ));
        }
        self.instances.get_mut().remove(&source);
        self.registrations
            .insert(source, Registration { factory, config });
        Ok(())
    }

    pub fn registered_sources(&self) -> Vec<&str> {
        self.registrations.keys().map(String::as_str).collect()
    }

    /// Resolve a source to its (possibly cached) collector instance.
    async fn collector_for(&self, source: &str) -> Result<Arc<dyn Collector>, CollectError> {
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(source) {
            return Ok(existing.clone());
        }

        let registration = self.registrations.get(source).ok_or_else(|| {
            CollectError::Configuration(format!("no collector registered for source '{source}'"))
        })?;
        let collector = registration.factory.create(&registration.config)?;
        instances.insert(source.to_string(), collector.clone());
        Ok(collector)
    }

    /// Run one task to a terminal state and return it.
    ///
    /// An unknown source fails immediately with zero retries: that's a
    /// configuration problem, not a transient one. Otherwise the operation is
    /// attempted in a bounded loop: a retryable error within both the task's
    /// `max_retries` and the category's attempt budget sleeps out its backoff
    /// (suspending only this task) and tries again.
    pub async fn dispatch(&self, mut task: Task) -> Task {
        if task.status.is_terminal() {
            tracing::warn!(task_id = %task.id, status = %task.status, "Refusing to re-dispatch terminal task");
            return task;
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        if task.source.is_empty() {
            let err = CollectError::Validation("task has an empty source".into());
            self.log_error(&task, &err, false);
            return self.fail(task, &err);
        }

        let collector = match self.collector_for(&task.source).await {
            Ok(collector) => collector,
            Err(err) => {
                self.log_error(&task, &err, false);
                return self.fail(task, &err);
            }
        };

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());

        loop {
            tracing::debug!(
                task_id = %task.id,
                source = %task.source,
                operation = %task.operation,
                attempt = task.retry_count + 1,
                "Executing task"
            );

            let result = match task.operation {
                Operation::Fetch => collector.fetch(&task.params).await,
                Operation::Store => collector.store(&task.params).await,
            };

            let err = match result {
                Ok(value) => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.result = Some(value);
                    task.error_message = None;
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        task_id = %task.id,
                        source = %task.source,
                        retries = task.retry_count,
                        "Task completed"
                    );
                    return task;
                }
                Err(err) => err,
            };

            let attempts_so_far = task.retry_count + 1;
            let will_retry = err.is_retryable()
                && task.can_retry()
                && self
                    .retry_policy
                    .schedule(err.category())
                    .allows_attempt(attempts_so_far);

            self.log_error(&task, &err, will_retry);

            if !will_retry {
                return self.fail(task, &err);
            }

            task.retry_count += 1;
            task.status = TaskStatus::Retrying;
            self.counters.retried.fetch_add(1, Ordering::Relaxed);

            let delay = self.retry_policy.delay_for_error(&err, task.retry_count);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.status = TaskStatus::Running;
        }
    }

    /// Fan out a batch of tasks concurrently and collect them all back.
    ///
    /// A task that fails internally comes back as a `Failed` task object; the
    /// batch call itself never fails and never drops a sibling.
    pub async fn dispatch_batch(&self, tasks: Vec<Task>) -> Vec<Task> {
        join_all(tasks.into_iter().map(|task| self.dispatch(task))).await
    }

    pub fn stats(&self) -> DispatcherStats {
        let dispatched = self.counters.dispatched.load(Ordering::Relaxed);
        let completed = self.counters.completed.load(Ordering::Relaxed);
        DispatcherStats {
            tasks_dispatched: dispatched,
            tasks_completed: completed,
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            tasks_retried: self.counters.retried.load(Ordering::Relaxed),
            success_rate: if dispatched == 0 {
                0.0
            } else {
                completed as f64 / dispatched as f64
            },
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Stop every collector instance created so far. Idempotent; a failing
    /// stop is logged and never blocks the remaining collectors.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let instances: Vec<(String, Arc<dyn Collector>)> =
            self.instances.lock().await.drain().collect();

        for (source, collector) in instances {
            match collector.stop().await {
                Ok(()) => tracing::debug!(source = %source, "Collector stopped"),
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Collector stop failed during shutdown");
                }
            }
        }
        tracing::info!("Dispatcher shut down");
    }

    fn fail(&self, mut task: Task, err: &CollectError) -> Task {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error_message = Some(err.to_string());
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        task
    }

    fn log_error(&self, task: &Task, err: &CollectError, will_retry: bool) {
        match err.severity() {
            Severity::Low => tracing::debug!(
                task_id = %task.id,
                source = %task.source,
                category = %err.category(),
                will_retry,
                error = %err,
                "Task attempt failed"
            ),
            Severity::Medium => tracing::warn!(
                task_id = %task.id,
                source = %task.source,
                category = %err.category(),
                will_retry,
                error = %err,
                "Task attempt failed"
            ),
            Severity::High | Severity::Critical => tracing::error!(
                task_id = %task.id,
                source = %task.source,
                category = %err.category(),
                will_retry,
                error = %err,
                "Task attempt failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;
    use crate::testutil::*;

    fn dispatcher_with(source: &str, factory: MockCollectorFactory) -> Dispatcher {
        let mut dispatcher = Dispatcher::with_retry_policy(RetryPolicy::immediate());
        dispatcher
            .register(
                source,
                Arc::new(factory),
                SourceConfig::new("https://stats.example.com"),
            )
            .unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn test_unknown_source_fails_without_retry() {
        let dispatcher = Dispatcher::with_retry_policy(RetryPolicy::immediate());
        let task = dispatcher
            .dispatch(make_test_task("nowhere").with_max_retries(3))
            .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_message.unwrap().contains("nowhere"));

        let stats = dispatcher.stats();
        assert_eq!(stats.tasks_dispatched, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_retried, 0);
    }

    #[tokio::test]
    async fn test_empty_source_fails_validation() {
        let dispatcher = Dispatcher::with_retry_policy(RetryPolicy::immediate());
        let task = dispatcher.dispatch(make_test_task("")).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_message.unwrap().contains("empty source"));
    }

    #[tokio::test]
    async fn test_successful_dispatch_stores_result() {
        let payload = serde_json::json!({"teams": ["ravens", "chiefs"]});
        let factory = MockCollectorFactory::succeeding(payload.clone());
        let dispatcher = dispatcher_with("nflstats", factory);

        let task = dispatcher.dispatch(make_test_task("nflstats")).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(payload));
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert!(task.error_message.is_none());
    }

    #[tokio::test]
    async fn test_client_error_fails_fast() {
        let factory = MockCollectorFactory::with_responses(vec![Err(CollectError::Client {
            message: "not found".into(),
            status: 404,
        })]);
        let dispatcher = dispatcher_with("nflstats", factory);

        let task = dispatcher
            .dispatch(make_test_task("nflstats").with_max_retries(3))
            .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0, "4xx must never be retried");
        assert_eq!(dispatcher.stats().tasks_retried, 0);
    }

    #[tokio::test]
    async fn test_network_error_recovers_on_second_attempt() {
        let factory = MockCollectorFactory::with_responses(vec![
            Err(CollectError::Network("connection reset".into())),
            Ok(serde_json::json!({"ok": true})),
        ]);
        let dispatcher = dispatcher_with("nflstats", factory);

        let task = dispatcher
            .dispatch(make_test_task("nflstats").with_max_retries(3))
            .await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(dispatcher.stats().tasks_retried, 1);
        assert_eq!(dispatcher.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_retry_count_never_exceeds_max_retries() {
        let factory = MockCollectorFactory::failing_with(|| {
            CollectError::Network("connection reset".into())
        });
        let dispatcher = dispatcher_with("nflstats", factory);

        let task = dispatcher
            .dispatch(make_test_task("nflstats").with_max_retries(1))
            .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_category_budget_caps_attempts_below_max_retries() {
        // Content errors allow a single retry even with a generous task budget.
        let factory =
            MockCollectorFactory::failing_with(|| CollectError::Content("bad payload".into()));
        let dispatcher = dispatcher_with("nflstats", factory);

        let task = dispatcher
            .dispatch(make_test_task("nflstats").with_max_retries(5))
            .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_after_hint_is_honored_as_delay() {
        let factory = MockCollectorFactory::with_responses(vec![
            Err(CollectError::RateLimit {
                message: "too many requests".into(),
                retry_after: Some(Duration::from_millis(150)),
            }),
            Ok(serde_json::json!({"ok": true})),
        ]);
        let dispatcher = dispatcher_with("nflstats", factory);

        let start = Instant::now();
        let task = dispatcher.dispatch(make_test_task("nflstats")).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(
            start.elapsed() >= Duration::from_millis(140),
            "Retry-After was not waited out, elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_dispatched_counted_once_despite_retries() {
        let factory = MockCollectorFactory::with_responses(vec![
            Err(CollectError::Network("reset".into())),
            Err(CollectError::Network("reset".into())),
            Ok(serde_json::json!({})),
        ]);
        let dispatcher = dispatcher_with("nflstats", factory);

        dispatcher
            .dispatch(make_test_task("nflstats").with_max_retries(3))
            .await;

        let stats = dispatcher.stats();
        assert_eq!(stats.tasks_dispatched, 1);
        assert_eq!(stats.tasks_retried, 2);
    }

    #[tokio::test]
    async fn test_batch_mixes_failures_and_successes() {
        let factory = MockCollectorFactory::succeeding(serde_json::json!({"ok": true}));
        let mut dispatcher = Dispatcher::with_retry_policy(RetryPolicy::immediate());
        dispatcher
            .register(
                "nflstats",
                Arc::new(factory),
                SourceConfig::new("https://stats.example.com"),
            )
            .unwrap();

        let tasks = vec![
            make_test_task("nflstats"),
            make_test_task("unregistered-a"),
            make_test_task("nflstats"),
            make_test_task("unregistered-b"),
            make_test_task("nflstats").with_priority(Priority::Critical),
        ];
        let results = dispatcher.dispatch_batch(tasks).await;

        assert_eq!(results.len(), 5, "No task may be dropped from a batch");
        let failed = results
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let completed = results
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        assert_eq!(failed, 2);
        assert_eq!(completed, 3);

        let stats = dispatcher.stats();
        assert_eq!(stats.tasks_dispatched, 5);
        assert!((stats.success_rate - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_terminal_task_is_not_redispatched() {
        let factory = MockCollectorFactory::succeeding(serde_json::json!({}));
        let dispatcher = dispatcher_with("nflstats", factory);

        let done = dispatcher.dispatch(make_test_task("nflstats")).await;
        assert_eq!(done.status, TaskStatus::Completed);

        let again = dispatcher.dispatch(done.clone()).await;
        assert_eq!(again.status, TaskStatus::Completed);
        assert_eq!(dispatcher.stats().tasks_dispatched, 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut dispatcher = Dispatcher::new();
        let factory = MockCollectorFactory::succeeding(serde_json::json!({}));
        dispatcher
            .register(
                "nflstats",
                Arc::new(factory.clone()),
                SourceConfig::new("https://stats.example.com"),
            )
            .unwrap();

        let err = dispatcher
            .register(
                "nflstats",
                Arc::new(factory.clone()),
                SourceConfig::new("https://stats.example.com"),
            )
            .unwrap_err();
        assert!(matches!(err, CollectError::Configuration(_)));

        // Explicit override is allowed.
        dispatcher
            .register_override(
                "nflstats",
                Arc::new(factory),
                SourceConfig::new("https://stats2.example.com"),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_factory_error_fails_task() {
        let factory = MockCollectorFactory::with_create_error(CollectError::Configuration(
            "missing api key".into(),
        ));
        let dispatcher = dispatcher_with("nflstats", factory);

        let task = dispatcher.dispatch(make_test_task("nflstats")).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_created_collectors() {
        let good = MockCollectorFactory::succeeding(serde_json::json!({}));
        let bad = MockCollectorFactory::succeeding(serde_json::json!({}));
        bad.set_stop_error(CollectError::Storage("flush failed".into()));

        let mut dispatcher = Dispatcher::with_retry_policy(RetryPolicy::immediate());
        dispatcher
            .register(
                "good",
                Arc::new(good.clone()),
                SourceConfig::new("https://a.example.com"),
            )
            .unwrap();
        dispatcher
            .register(
                "bad",
                Arc::new(bad.clone()),
                SourceConfig::new("https://b.example.com"),
            )
            .unwrap();

        dispatcher.dispatch(make_test_task("good")).await;
        dispatcher.dispatch(make_test_task("bad")).await;

        // One collector failing to stop must not block the other.
        dispatcher.shutdown().await;
        assert_eq!(good.stop_calls(), 1);
        assert_eq!(bad.stop_calls(), 1);

        // Idempotent: a second shutdown is a no-op.
        dispatcher.shutdown().await;
        assert_eq!(good.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_store_operation_routes_to_store() {
        let factory = MockCollectorFactory::succeeding(serde_json::json!({"stored": true}));
        let dispatcher = dispatcher_with("nflstats", factory.clone());

        let task = Task::new("nflstats", Operation::Store);
        let task = dispatcher.dispatch(task).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(factory.collector().store_calls(), 1);
        assert_eq!(factory.collector().fetch_calls(), 0);
    }
}
