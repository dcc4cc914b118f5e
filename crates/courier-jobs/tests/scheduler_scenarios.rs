//! End-to-end scheduler behaviour over the in-memory backend.
//!
//! Runs on a paused clock, so timeouts and probe intervals elapse instantly.

use async_trait::async_trait;
use courier_config::{QueueDriver, SchedulerSettings};
use courier_jobs::prelude::*;
use courier_jobs::{AsyncJobManager, InMemoryQueue, JobStats, QueueMessage, WorkableRegistry, WorkerManager};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Tracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    attempts: Mutex<Vec<Value>>,
    last_errors: Mutex<Vec<Value>>,
}

impl Tracker {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn record(&self, payload: &Payload) {
        self.attempts
            .lock()
            .push(payload.get("_retry_count").cloned().unwrap_or(Value::Null));
        self.last_errors
            .lock()
            .push(payload.get("_last_error").cloned().unwrap_or(Value::Null));
    }
}

/// Sleeps 100ms per payload, two at a time.
struct Resize {
    state: WorkableState,
    tracker: Arc<Tracker>,
}

/// Always fails; retried twice.
struct Charge {
    state: WorkableState,
    tracker: Arc<Tracker>,
}

/// Never finishes; times out after one second.
struct Stuck {
    state: WorkableState,
    retry_on_timeout: bool,
}

/// A plain synchronous job.
#[derive(Default)]
struct Audit {
    state: WorkableState,
}

/// Implements the async contract but keeps the default, non-async config.
#[derive(Default)]
struct Deferred {
    state: WorkableState,
}

/// Succeeds, fails or hangs past its timeout depending on the payload.
struct Mixed {
    state: WorkableState,
    executed: Arc<AtomicUsize>,
}

macro_rules! workable {
    ($($ty:ty),*) => {
        $(impl Workable for $ty {
            fn state(&self) -> &WorkableState {
                &self.state
            }

            fn state_mut(&mut self) -> &mut WorkableState {
                &mut self.state
            }
        }

        impl Job for $ty {
            fn execute(&mut self, _payload: &Payload) -> JobResult<()> {
                Ok(())
            }
        })*
    };
}

workable!(Resize, Charge, Stuck, Audit, Deferred, Mixed);

impl AsyncJob for Resize {
    fn config(&self) -> AsyncJobConfig {
        AsyncJobConfig::asynchronous().with_max_concurrency(2)
    }

    fn execute_async(self: Box<Self>, payload: Payload) -> BoxFuture<'static, JobResult<()>> {
        Box::pin(async move {
            self.tracker.enter();
            self.tracker.record(&payload);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.tracker.exit();
            Ok(())
        })
    }
}

impl AsyncJob for Charge {
    fn config(&self) -> AsyncJobConfig {
        AsyncJobConfig::asynchronous().with_retries(2)
    }

    fn execute_async(self: Box<Self>, payload: Payload) -> BoxFuture<'static, JobResult<()>> {
        Box::pin(async move {
            self.tracker.record(&payload);
            Err(JobError::failed("card declined"))
        })
    }
}

impl AsyncJob for Stuck {
    fn config(&self) -> AsyncJobConfig {
        AsyncJobConfig::asynchronous()
            .with_timeout(Duration::from_secs(1))
            .with_retries(3)
            .with_retry_on_timeout(self.retry_on_timeout)
    }

    fn execute_async(self: Box<Self>, _payload: Payload) -> BoxFuture<'static, JobResult<()>> {
        Box::pin(futures::future::pending())
    }
}

impl AsyncJob for Deferred {
    fn config(&self) -> AsyncJobConfig {
        AsyncJobConfig::default()
    }
}

impl AsyncJob for Mixed {
    fn config(&self) -> AsyncJobConfig {
        AsyncJobConfig::asynchronous()
            .with_max_concurrency(3)
            .with_timeout(Duration::from_secs(1))
    }

    fn execute_async(self: Box<Self>, payload: Payload) -> BoxFuture<'static, JobResult<()>> {
        Box::pin(async move {
            self.executed.fetch_add(1, Ordering::SeqCst);
            let delay = payload.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            match payload.get("outcome").and_then(Value::as_str) {
                Some("hang") => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                Some("fail") => {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Err(JobError::failed("upstream rejected"))
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(())
                }
            }
        })
    }
}

/// In-memory queue that accepts a fixed number of pushes, then reports the
/// backend as unavailable.
struct FlakyQueue {
    inner: InMemoryQueue,
    accepted: AtomicUsize,
    limit: usize,
}

#[async_trait]
impl QueueBackend for FlakyQueue {
    fn driver(&self) -> QueueDriver {
        QueueDriver::Memory
    }

    fn queue_prefix(&self) -> &str {
        self.inner.queue_prefix()
    }

    async fn push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        if self.accepted.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(JobError::BackendUnavailable("connection reset".to_string()));
        }
        self.inner.push(queue, payload).await
    }

    async fn pop(&self, queue: &str) -> Option<QueueMessage> {
        self.inner.pop(queue).await
    }

    async fn size(&self, queue: &str) -> u64 {
        self.inner.size(queue).await
    }

    async fn clear(&self, queue: &str) {
        self.inner.clear(queue).await;
    }
}

/// Deterministic pseudo-random sequence for varied timings.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

fn resize(tracker: &Arc<Tracker>) -> Resize {
    Resize {
        state: WorkableState::new(),
        tracker: tracker.clone(),
    }
}

fn charge(tracker: &Arc<Tracker>) -> Charge {
    Charge {
        state: WorkableState::new(),
        tracker: tracker.clone(),
    }
}

fn stuck(retry_on_timeout: bool) -> Stuck {
    Stuck {
        state: WorkableState::new(),
        retry_on_timeout,
    }
}

fn manager(entries: Vec<WorkableEntry>) -> (AsyncJobManager, Arc<InMemoryQueue>) {
    let backend = Arc::new(InMemoryQueue::new("test_"));
    let mut registry = WorkableRegistry::new();
    for entry in entries {
        registry.register(entry).unwrap();
    }
    let workers = WorkerManager::new(backend.clone(), Arc::new(registry));
    (AsyncJobManager::new(workers, &SchedulerSettings::default()), backend)
}

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

async fn wait_for(manager: &AsyncJobManager, name: &str, done: impl Fn(&JobStats) -> bool) -> JobStats {
    for _ in 0..1_000 {
        if let Some(stats) = manager.get_job_stats(name) {
            if done(&stats) {
                return stats;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name} never reached the expected stats: {:?}", manager.get_job_stats(name));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_max() {
    let tracker = Arc::new(Tracker::default());
    let entry = {
        let tracker = tracker.clone();
        WorkableEntry::async_job(move || resize(&tracker))
    };
    let (manager, _) = manager(vec![entry]);
    let workers = manager.workers().clone();

    for n in 0..5 {
        workers.push_job("Resize", &payload(json!({ "image": n }))).await.unwrap();
    }

    manager.start_async_processing("Resize", &resize(&tracker)).await.unwrap();
    let stats = manager.get_job_stats("Resize").unwrap();
    assert_eq!(stats.running, 2);
    assert_eq!(workers.pending("Resize").await, 3);

    let stats = wait_for(&manager, "Resize", |s| s.completed == 5).await;
    assert_eq!(stats.running, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
    assert_eq!(workers.pending("Resize").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_probe_picks_up_payloads_pushed_while_idle() {
    let tracker = Arc::new(Tracker::default());
    let entry = {
        let tracker = tracker.clone();
        WorkableEntry::async_job(move || resize(&tracker))
    };
    let (manager, _) = manager(vec![entry]);

    manager.start_async_processing("Resize", &resize(&tracker)).await.unwrap();
    assert_eq!(manager.get_job_stats("Resize").unwrap().running, 0);

    manager
        .workers()
        .push_job("Resize", &payload(json!({ "image": "late" })))
        .await
        .unwrap();

    let stats = wait_for(&manager, "Resize", |s| s.completed == 1).await;
    assert_eq!(stats.running, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_requeue_until_retries_exhausted() {
    let tracker = Arc::new(Tracker::default());
    let entry = {
        let tracker = tracker.clone();
        WorkableEntry::async_job(move || charge(&tracker))
    };
    let (manager, backend) = manager(vec![entry]);

    manager
        .workers()
        .push_job("Charge", &payload(json!({ "order": 42 })))
        .await
        .unwrap();
    manager.start_async_processing("Charge", &charge(&tracker)).await.unwrap();

    let stats = wait_for(&manager, "Charge", |s| s.failed == 3).await;
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.running, 0);

    assert_eq!(*tracker.attempts.lock(), vec![Value::Null, json!(1), json!(2)]);
    assert_eq!(
        *tracker.last_errors.lock(),
        vec![Value::Null, json!("card declined"), json!("card declined")]
    );
    assert!(backend.snapshot("test_Charge_queue").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_frees_slot_without_requeue() {
    let (manager, _) = manager(vec![WorkableEntry::async_job(|| stuck(false))]);
    let workers = manager.workers().clone();

    workers.push_job("Stuck", &payload(json!({ "id": 1 }))).await.unwrap();
    manager.start_async_processing("Stuck", &stuck(false)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.get_job_stats("Stuck").unwrap().running, 1);
    assert_eq!(manager.executions("Stuck").len(), 1);

    let stats = wait_for(&manager, "Stuck", |s| s.timed_out == 1).await;
    assert_eq!(stats.running, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.retried, 0);
    assert!(manager.executions("Stuck").is_empty());
    assert_eq!(workers.pending("Stuck").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_requeues_when_opted_in() {
    let (manager, _) = manager(vec![WorkableEntry::async_job(|| stuck(true))]);

    manager
        .workers()
        .push_job("Stuck", &payload(json!({ "id": 1 })))
        .await
        .unwrap();
    manager.start_async_processing("Stuck", &stuck(true)).await.unwrap();

    let stats = wait_for(&manager, "Stuck", |s| s.retried == 1).await;
    assert_eq!(stats.timed_out, 1);
    // The requeued payload is dispatched again right away.
    assert_eq!(stats.running, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_processing_discards_pool() {
    let (manager, _) = manager(vec![WorkableEntry::async_job(|| stuck(false))]);
    let workers = manager.workers().clone();

    workers.push_job("Stuck", &payload(json!({ "id": 1 }))).await.unwrap();
    manager.start_async_processing("Stuck", &stuck(false)).await.unwrap();
    assert!(manager.is_processing("Stuck"));

    assert!(manager.stop_processing("Stuck"));
    assert!(!manager.stop_processing("Stuck"));
    assert!(manager.get_job_stats("Stuck").is_none());
    assert!(manager.get_all_job_stats().is_empty());

    workers.push_job("Stuck", &payload(json!({ "id": 2 }))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(workers.pending("Stuck").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_unknown_and_sync_jobs() {
    let (manager, _) = manager(vec![
        WorkableEntry::async_job(|| stuck(false)),
        WorkableEntry::job(Audit::default),
    ]);

    let err = manager.start_async_processing("Missing", &stuck(false)).await.unwrap_err();
    assert!(matches!(err, JobError::JobNotFound(name) if name == "Missing"));

    let err = manager.start_async_processing("Audit", &stuck(false)).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidWorkable(_)));
    assert!(!manager.is_processing("Audit"));
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_job_not_configured_as_async() {
    let (manager, _) = manager(vec![WorkableEntry::async_job(Deferred::default)]);
    manager
        .workers()
        .push_job("Deferred", &payload(json!({ "id": 1 })))
        .await
        .unwrap();

    let err = manager
        .start_async_processing("Deferred", &Deferred::default())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidWorkable(msg) if msg.contains("not configured as async")));
    assert!(!manager.is_processing("Deferred"));
    assert_eq!(manager.workers().pending("Deferred").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_requeue_counts_dropped_retry() {
    let tracker = Arc::new(Tracker::default());
    let backend = Arc::new(FlakyQueue {
        inner: InMemoryQueue::new("test_"),
        accepted: AtomicUsize::new(0),
        limit: 1,
    });
    let mut registry = WorkableRegistry::new();
    registry
        .register({
            let tracker = tracker.clone();
            WorkableEntry::async_job(move || charge(&tracker))
        })
        .unwrap();
    let workers = WorkerManager::new(backend, Arc::new(registry));
    let manager = AsyncJobManager::new(workers, &SchedulerSettings::default());

    manager
        .workers()
        .push_job("Charge", &payload(json!({ "order": 7 })))
        .await
        .unwrap();
    manager.start_async_processing("Charge", &charge(&tracker)).await.unwrap();

    let stats = wait_for(&manager, "Charge", |s| s.retry_dropped == 1).await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.exhausted, 0);
    assert_eq!(stats.running, 0);
    assert_eq!(manager.workers().pending("Charge").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_outcomes_respect_bound_and_account_every_dispatch() {
    const TOTAL: usize = 40;
    let executed = Arc::new(AtomicUsize::new(0));
    let entry = {
        let executed = executed.clone();
        WorkableEntry::async_job(move || Mixed {
            state: WorkableState::new(),
            executed: executed.clone(),
        })
    };
    let (manager, _) = manager(vec![entry]);
    let workers = manager.workers().clone();

    let mut rng = Lcg(0x5eed);
    let (mut oks, mut fails, mut hangs) = (0u64, 0u64, 0u64);
    for n in 0..TOTAL {
        let roll = rng.next() % 10;
        let outcome = match n {
            0 => "ok",
            1 => "fail",
            2 => "hang",
            _ if roll < 6 => "ok",
            _ if roll < 9 => "fail",
            _ => "hang",
        };
        match outcome {
            "ok" => oks += 1,
            "fail" => fails += 1,
            _ => hangs += 1,
        }
        let delay_ms = 10 + rng.next() % 400;
        workers
            .push_job("Mixed", &payload(json!({ "n": n, "outcome": outcome, "delay_ms": delay_ms })))
            .await
            .unwrap();
    }

    let template = Mixed {
        state: WorkableState::new(),
        executed: Arc::new(AtomicUsize::new(0)),
    };
    manager.start_async_processing("Mixed", &template).await.unwrap();

    let mut peak = 0;
    let mut drained = None;
    for _ in 0..100_000 {
        let stats = manager.get_job_stats("Mixed").unwrap();
        assert!(stats.running <= 3, "running exceeded the bound: {stats:?}");
        assert!(manager.executions("Mixed").len() <= 3);
        peak = peak.max(stats.running);
        if stats.finished() == TOTAL as u64 {
            drained = Some(stats);
            break;
        }
        tokio::time::sleep(Duration::from_millis(7)).await;
    }
    let stats = drained.expect("queue never drained");

    assert_eq!(peak, 3);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.completed + stats.failed, executed.load(Ordering::SeqCst) as u64);
    assert_eq!(stats.completed, oks);
    assert_eq!(stats.failed, fails + hangs);
    assert_eq!(stats.timed_out, hangs);
    assert_eq!(stats.retried, 0);
    assert_eq!(workers.pending("Mixed").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_resets_stats() {
    let tracker = Arc::new(Tracker::default());
    let entry = {
        let tracker = tracker.clone();
        WorkableEntry::async_job(move || charge(&tracker))
    };
    let (manager, _) = manager(vec![entry]);

    manager
        .workers()
        .push_job("Charge", &payload(json!({ "order": 1 })))
        .await
        .unwrap();
    manager.start_async_processing("Charge", &charge(&tracker)).await.unwrap();
    wait_for(&manager, "Charge", |s| s.exhausted == 1).await;

    manager.start_async_processing("Charge", &charge(&tracker)).await.unwrap();
    let stats = manager.get_all_job_stats().remove("Charge").unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.max_retries, 2);
    assert!(stats.retry_enabled);
}
