//! Dispatcher behaviour against the in-memory broker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use citycatpg::dispatch::{DispatchOptions, DispatchSummary, Dispatcher, MemoryQueue};
use citycatpg::models::JobConfig;
use citycatpg::pipeline::{JobOutcome, JobRunner, PipelineError, RetryPolicy};

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    /// Fetch never resolves.
    HangOnFetch,
    /// First fetch reports an outage.
    FlakyFetch,
}

/// Runner with scripted behaviour per job id. Unknown ids are not found.
struct FakeRunner {
    jobs: HashMap<String, Behaviour>,
    hold: Duration,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    fetches: AtomicUsize,
    runs: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn new(jobs: &[(&str, Behaviour)], hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs: jobs.iter().map(|(id, b)| (id.to_string(), *b)).collect(),
            hold,
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
        })
    }

    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn fetch(&self, job_id: &str) -> Result<JobConfig, PipelineError> {
        let previous = self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.jobs.get(job_id) {
            None => Err(PipelineError::NotFound(job_id.to_string())),
            Some(Behaviour::HangOnFetch) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Behaviour::FlakyFetch) if previous == 0 => {
                Err(PipelineError::StoreUnavailable("connection refused".to_string()))
            }
            Some(_) => {
                let mut config = JobConfig::new(60).with_uniform_rain(10.0, 30);
                config.run_id = job_id.to_string();
                Ok(config)
            }
        }
    }

    async fn run(&self, config: JobConfig) -> Result<JobOutcome, PipelineError> {
        self.runs.lock().unwrap().push(config.run_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        match self.jobs.get(&config.run_id) {
            Some(Behaviour::Fail) => Err(PipelineError::Configuration("bad layer".to_string())),
            Some(Behaviour::Panic) => panic!("solver wrapper exploded"),
            _ => Ok(JobOutcome::SolverUnavailable {
                run_dir: PathBuf::from(config.slug()),
            }),
        }
    }
}

fn options(concurrency: u16, drain: bool) -> DispatchOptions {
    DispatchOptions {
        queue: "runs".to_string(),
        concurrency,
        drain_on_empty: drain,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    }
}

async fn drain(queue: &MemoryQueue, runner: Arc<FakeRunner>, concurrency: u16) -> DispatchSummary {
    let broker = queue.connect(concurrency);
    let dispatcher = Dispatcher::new(broker, runner, options(concurrency, true));
    tokio::time::timeout(Duration::from_secs(10), dispatcher.run(CancellationToken::new()))
        .await
        .expect("dispatcher did not drain")
        .expect("broker error")
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let ids: Vec<String> = (0..10).map(|i| format!("job-{i}")).collect();
    let jobs: Vec<(&str, Behaviour)> = ids.iter().map(|id| (id.as_str(), Behaviour::Succeed)).collect();
    let runner = FakeRunner::new(&jobs, Duration::from_millis(20));

    let queue = MemoryQueue::new();
    for id in &ids {
        queue.publish(id.as_str());
    }

    let summary = drain(&queue, Arc::clone(&runner), 3).await;

    assert_eq!(summary.delivered, 10);
    assert_eq!(summary.succeeded, 10);
    assert!(summary.peak_dispatched <= 3);
    assert!(runner.peak_running.load(Ordering::SeqCst) <= 3);
    assert!(runner.peak_running.load(Ordering::SeqCst) > 1);
    assert!(queue.peak_unacked() <= 3);
    assert_eq!(sorted(queue.acked()), sorted(ids));
    assert_eq!(queue.ready_len(), 0);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test]
async fn test_success_and_failure_acked_exactly_once() {
    let runner = FakeRunner::new(
        &[
            ("ok-1", Behaviour::Succeed),
            ("broken", Behaviour::Fail),
            ("ok-2", Behaviour::Succeed),
        ],
        Duration::from_millis(5),
    );
    let queue = MemoryQueue::new();
    for id in ["ok-1", "broken", "ok-2"] {
        queue.publish(id);
    }

    let summary = drain(&queue, Arc::clone(&runner), 2).await;

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        sorted(queue.acked()),
        vec!["broken".to_string(), "ok-1".to_string(), "ok-2".to_string()]
    );
    assert_eq!(queue.requeued(), 0);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test]
async fn test_drain_on_empty_queue_returns_immediately() {
    let runner = FakeRunner::new(&[], Duration::ZERO);
    let queue = MemoryQueue::new();

    let summary = tokio::time::timeout(Duration::from_millis(500), drain(&queue, runner, 1))
        .await
        .unwrap();

    assert_eq!(summary, DispatchSummary::default());
}

#[tokio::test]
async fn test_drain_runs_deliveries_pushed_by_last_ack() {
    let runner = FakeRunner::new(
        &[
            ("a", Behaviour::Succeed),
            ("b", Behaviour::Succeed),
            ("c", Behaviour::Succeed),
        ],
        Duration::from_millis(5),
    );
    let queue = MemoryQueue::new();
    for id in ["a", "b", "c"] {
        queue.publish(id);
    }

    let summary = drain(&queue, Arc::clone(&runner), 1).await;

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(runner.runs(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(
        queue.acked(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert_eq!(queue.ready_len(), 0);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test]
async fn test_not_found_spawns_no_worker() {
    let runner = FakeRunner::new(&[("known", Behaviour::Succeed)], Duration::ZERO);
    let queue = MemoryQueue::new();
    queue.publish("missing");
    queue.publish("known");

    let summary = drain(&queue, Arc::clone(&runner), 1).await;

    assert_eq!(summary.unresolved, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(runner.runs(), vec!["known".to_string()]);
    assert_eq!(sorted(queue.acked()), vec!["known".to_string(), "missing".to_string()]);
}

#[tokio::test]
async fn test_unreadable_body_is_acked() {
    let runner = FakeRunner::new(&[], Duration::ZERO);
    let queue = MemoryQueue::new();
    queue.publish(vec![0xffu8, 0xfe]);
    queue.publish("   ");

    let summary = drain(&queue, Arc::clone(&runner), 1).await;

    assert_eq!(summary.unresolved, 2);
    assert_eq!(runner.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test]
async fn test_duplicate_in_flight_is_rejected() {
    let runner = FakeRunner::new(&[("same", Behaviour::Succeed)], Duration::from_millis(100));
    let queue = MemoryQueue::new();
    queue.publish("same");
    queue.publish("same");

    let summary = drain(&queue, Arc::clone(&runner), 2).await;

    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(runner.runs().len(), 1);
    assert_eq!(queue.acked().len(), 2);
}

#[tokio::test]
async fn test_same_id_after_completion_runs_again() {
    let runner = FakeRunner::new(&[("again", Behaviour::Succeed)], Duration::ZERO);
    let queue = MemoryQueue::new();
    queue.publish("again");
    queue.publish("again");

    let summary = drain(&queue, Arc::clone(&runner), 1).await;

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.duplicates, 0);
}

#[tokio::test]
async fn test_panicking_worker_counts_as_failed() {
    let runner = FakeRunner::new(
        &[("boom", Behaviour::Panic), ("fine", Behaviour::Succeed)],
        Duration::ZERO,
    );
    let queue = MemoryQueue::new();
    queue.publish("boom");
    queue.publish("fine");

    let summary = drain(&queue, Arc::clone(&runner), 2).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(sorted(queue.acked()), vec!["boom".to_string(), "fine".to_string()]);
}

#[tokio::test]
async fn test_store_outage_during_fetch_is_retried() {
    let runner = FakeRunner::new(&[("flaky", Behaviour::FlakyFetch)], Duration::ZERO);
    let queue = MemoryQueue::new();
    queue.publish("flaky");

    let summary = drain(&queue, Arc::clone(&runner), 1).await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(runner.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_and_releases_unstarted() {
    let runner = FakeRunner::new(
        &[("long", Behaviour::Succeed), ("stuck", Behaviour::HangOnFetch)],
        Duration::from_millis(200),
    );
    let queue = MemoryQueue::new();
    queue.publish("long");
    queue.publish("stuck");

    let broker = queue.connect(2);
    let dispatcher = Dispatcher::new(broker, Arc::clone(&runner), options(2, false));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.running.load(Ordering::SeqCst), 1);
    shutdown.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.released, 1);
    assert_eq!(runner.running.load(Ordering::SeqCst), 0);
    assert_eq!(queue.acked(), vec!["long".to_string()]);
    assert_eq!(queue.ready_len(), 1);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test]
async fn test_shutdown_while_idle_returns() {
    let runner = FakeRunner::new(&[], Duration::ZERO);
    let queue = MemoryQueue::new();
    let dispatcher = Dispatcher::new(queue.connect(1), runner, options(1, false));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.delivered, 0);
}
