/// End-to-end demo of the dispatch engine against a simulated flaky source.
///
/// Spins up a local mock stats API that answers 429 (with Retry-After), then
/// 500, then clean JSON, and drives a small batch of tasks through the
/// dispatcher so the retry loop, rate limiter, circuit breaker, dedup index,
/// and checkpoint store all get exercised without touching the network.
///
/// Run with:
///   cargo run --example dispatch_demo -p statline-client
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use statline_client::GuardedClient;
use statline_core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use statline_core::collector::{Collector, CollectorFactory, CollectorStats, SourceConfig};
use statline_core::ratelimit::{DomainRateLimiter, RateLimiterConfig};
use statline_core::task::{Operation, Params, Task};
use statline_core::{CollectError, Dispatcher, RetryPolicy};
use statline_store::{CheckpointStore, DedupStore};

/// Collector for the demo scoreboard source: fetches weekly scores through
/// the guarded client, skips unchanged payloads, and checkpoints progress.
struct ScoreboardCollector {
    client: GuardedClient,
    base_url: String,
    dedup: Arc<DedupStore>,
    checkpoints: Arc<CheckpointStore>,
    made: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
}

#[async_trait]
impl Collector for ScoreboardCollector {
    async fn fetch(&self, params: &Params) -> Result<serde_json::Value, CollectError> {
        let week = params.get("week").and_then(|v| v.as_i64()).unwrap_or(1);
        let url = format!("{}/scores?week={week}", self.base_url);

        self.made.fetch_add(1, Ordering::Relaxed);
        let body = match self.client.get(&url).await {
            Ok(body) => body,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.ok.fetch_add(1, Ordering::Relaxed);

        let (is_dup, _) = self.dedup.check_duplicate(&body, "boxscore_json").await;
        if is_dup {
            println!("  week {week}: unchanged content, skipping duplicate write");
        } else {
            self.dedup.record(&body, "boxscore_json", "scoreboard").await?;
        }

        self.checkpoints
            .save_checkpoint("scoreboard-progress", serde_json::json!({"last_week": week}))
            .await?;

        serde_json::from_str(&body)
            .map_err(|e| CollectError::Content(format!("invalid scoreboard JSON: {e}")))
    }

    async fn store(&self, _params: &Params) -> Result<serde_json::Value, CollectError> {
        // Upload path is out of scope for the demo source.
        Ok(serde_json::json!({"uploaded": false}))
    }

    fn stats(&self) -> CollectorStats {
        CollectorStats {
            requests_made: self.made.load(Ordering::Relaxed),
            requests_successful: self.ok.load(Ordering::Relaxed),
            requests_failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn stop(&self) -> Result<(), CollectError> {
        Ok(())
    }
}

struct ScoreboardFactory {
    client: GuardedClient,
    dedup: Arc<DedupStore>,
    checkpoints: Arc<CheckpointStore>,
}

impl CollectorFactory for ScoreboardFactory {
    fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Collector>, CollectError> {
        Ok(Arc::new(ScoreboardCollector {
            client: self.client.clone(),
            base_url: config.base_url.clone(),
            dedup: self.dedup.clone(),
            checkpoints: self.checkpoints.clone(),
            made: AtomicU64::new(0),
            ok: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("statline=debug,info")
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // A flaky mock stats API: one 429 with Retry-After, one 500, then JSON.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scores"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/scores"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/scores"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"home": "ravens", "away": "chiefs", "score": [21, 17]}"#,
        ))
        .mount(&server)
        .await;

    let limiter = Arc::new(DomainRateLimiter::new(RateLimiterConfig {
        initial_rate: 20.0,
        ..RateLimiterConfig::default()
    }));
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let client = GuardedClient::new(limiter.clone(), breakers.clone())?;

    let workdir = tempfile::tempdir()?;
    let dedup = Arc::new(DedupStore::open(workdir.path().join("dedup.json"))?);
    let checkpoints = Arc::new(CheckpointStore::new(workdir.path().join("checkpoints"))?);

    match checkpoints.load_checkpoint("scoreboard-progress").await? {
        Some(cp) => println!("resuming from checkpoint: {cp}"),
        None => println!("no checkpoint yet, starting from week 1"),
    }

    // Zero-delay policy keeps the demo snappy; the 429's Retry-After=1s is
    // still enforced as the minimum wait.
    let mut dispatcher = Dispatcher::with_retry_policy(RetryPolicy::immediate());
    dispatcher.register(
        "scoreboard",
        Arc::new(ScoreboardFactory {
            client,
            dedup: dedup.clone(),
            checkpoints: checkpoints.clone(),
        }),
        SourceConfig::new(server.uri()),
    )?;

    let tasks: Vec<Task> = (1..=3)
        .map(|week| {
            Task::new("scoreboard", Operation::Fetch).with_param("week", serde_json::json!(week))
        })
        .collect();

    println!("dispatching {} tasks…", tasks.len());
    let results = dispatcher.dispatch_batch(tasks).await;

    for task in &results {
        println!(
            "  task {} -> {} (retries: {})",
            task.id, task.status, task.retry_count
        );
    }

    let stats = dispatcher.stats();
    println!(
        "dispatched={} completed={} failed={} retried={} success_rate={:.0}%",
        stats.tasks_dispatched,
        stats.tasks_completed,
        stats.tasks_failed,
        stats.tasks_retried,
        stats.success_rate * 100.0
    );

    let domain = statline_client::domain_key(&server.uri())?;
    if let Some(state) = limiter.snapshot(&domain).await {
        println!(
            "rate limiter for {domain}: {} at {:.2} rps after {} 429s",
            state.state, state.current_rate, state.consecutive_429s
        );
    }
    for breaker in breakers.all_stats() {
        println!(
            "circuit for {}: {} ({} recent failures)",
            breaker.endpoint, breaker.state, breaker.failure_count
        );
    }
    println!(
        "dedup index entries: {} · checkpoint: {:?}",
        dedup.len().await,
        checkpoints.load_checkpoint("scoreboard-progress").await?
    );

    dispatcher.shutdown().await;
    Ok(())
}
