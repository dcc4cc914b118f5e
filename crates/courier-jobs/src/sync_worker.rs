//! Synchronous worker loop.
//!
//! The fallback for jobs that are not async: pop, execute inline, repeat;
//! sleep a short interval when the queue is empty. No concurrency, no
//! timeout and no retry.

use crate::error::{JobError, JobResult};
use crate::job::JobInstance;
use crate::metrics::JobMetrics;
use crate::payload::Payload;
use crate::registry::WorkableEntry;
use crate::worker::WorkerManager;
use courier_config::SchedulerSettings;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

/// Counters of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub processed: u64,
    pub failed: u64,
}

/// Blocking-style loop over one job's queue.
pub struct SyncWorker {
    workers: WorkerManager,
    name: String,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    /// Subscribed at construction so a stop sent before `run` is kept.
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
    jobs_processed: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
}

impl SyncWorker {
    pub fn new(workers: WorkerManager, name: impl Into<String>, settings: &SchedulerSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            workers,
            name: name.into(),
            poll_interval: settings.sync_poll_interval(),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Stops the loop after the current execution.
    pub fn stop(&self) {
        info!(job_name = %self.name, "Stopping sync worker...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Runs until stopped. Fails only if the name does not resolve to a job.
    pub async fn run(&self) -> JobResult<SyncSummary> {
        let entry = self
            .workers
            .registry()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| JobError::JobNotFound(self.name.clone()))?;
        let mut instance = Self::instantiate(&entry)?;
        let mut shutdown_rx = self.shutdown_rx.lock().take().unwrap_or_else(|| self.shutdown_tx.subscribe());

        info!(
            job_name = %self.name,
            queue = ?self.workers.queue_for(&self.name),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting sync worker"
        );

        loop {
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                info!(job_name = %self.name, "Received shutdown signal");
                break;
            }

            match self.workers.next_job(&self.name).await {
                Some(payload) => {
                    instance = match self.execute(instance, payload).await {
                        Some(instance) => instance,
                        None => Self::instantiate(&entry)?,
                    };
                }
                None => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!(job_name = %self.name, "Received shutdown signal");
                            break;
                        }
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        let summary = SyncSummary {
            processed: self.processed(),
            failed: self.failed(),
        };
        info!(
            job_name = %self.name,
            processed = summary.processed,
            failed = summary.failed,
            "Sync worker stopped"
        );
        Ok(summary)
    }

    fn instantiate(entry: &WorkableEntry) -> JobResult<JobInstance> {
        entry
            .create_job()
            .ok_or_else(|| JobError::InvalidWorkable(format!("{} is a {}, not a job", entry.name(), entry.kind())))
    }

    /// Executes one payload on the blocking pool.
    ///
    /// Hands the instance back, or `None` if it panicked and must be rebuilt.
    async fn execute(&self, mut instance: JobInstance, payload: Payload) -> Option<JobInstance> {
        let started = Instant::now();
        debug!(job_name = %self.name, job_id = %instance.id(), "Executing job");

        let joined = tokio::task::spawn_blocking(move || {
            let result = instance.execute(&payload);
            (instance, result)
        })
        .await;
        let elapsed = started.elapsed();

        match joined {
            Ok((instance, Ok(()))) => {
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_completed(&self.name, elapsed);
                info!(
                    job_name = %self.name,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                Some(instance)
            }
            Ok((instance, Err(e))) => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(&self.name, e.kind(), elapsed);
                warn!(job_name = %self.name, error = %e, "Job failed");
                Some(instance)
            }
            Err(e) => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(&self.name, "panic", elapsed);
                error!(job_name = %self.name, error = %e, "Job panicked, rebuilding instance");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::queue::InMemoryQueue;
    use crate::registry::WorkableRegistry;
    use crate::workable::{Task, Workable, WorkableState};
    use serde_json::{json, Value};

    struct Ledger {
        state: WorkableState,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl Workable for Ledger {
        fn state(&self) -> &WorkableState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut WorkableState {
            &mut self.state
        }
    }

    impl Job for Ledger {
        fn execute(&mut self, payload: &Payload) -> JobResult<()> {
            let amount = payload.get("amount").cloned().unwrap_or(Value::Null);
            if amount.as_i64().is_some_and(|a| a < 0) {
                return Err(JobError::failed("negative amount"));
            }
            if amount.is_null() {
                panic!("missing amount");
            }
            self.seen.lock().push(amount);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Idle {
        state: WorkableState,
    }

    impl Workable for Idle {
        fn state(&self) -> &WorkableState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut WorkableState {
            &mut self.state
        }
    }

    impl Task for Idle {
        fn execute(&mut self) -> JobResult<()> {
            self.destroy();
            Ok(())
        }
    }

    fn workers(seen: Arc<Mutex<Vec<Value>>>) -> WorkerManager {
        let mut registry = WorkableRegistry::new();
        registry
            .register(WorkableEntry::job(move || Ledger {
                state: WorkableState::new(),
                seen: seen.clone(),
            }))
            .unwrap();
        registry.register(WorkableEntry::task(Idle::default)).unwrap();
        WorkerManager::new(Arc::new(InMemoryQueue::default()), Arc::new(registry))
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_processes_in_order_and_counts_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let workers = workers(seen.clone());
        for body in [json!({"amount": 5}), json!({"amount": -1}), json!({}), json!({"amount": 7})] {
            workers.push_job("Ledger", &payload(body)).await.unwrap();
        }

        let worker = Arc::new(
            SyncWorker::new(workers.clone(), "Ledger", &SchedulerSettings::default())
                .with_poll_interval(Duration::from_millis(10)),
        );
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        for _ in 0..200 {
            if worker.processed() + worker.failed() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.stop();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, SyncSummary { processed: 2, failed: 2 });
        assert_eq!(*seen.lock(), vec![json!(5), json!(7)]);
        assert_eq!(workers.pending("Ledger").await, 0);
    }

    #[tokio::test]
    async fn test_stop_before_run_is_not_lost() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let workers = workers(seen.clone());
        workers.push_job("Ledger", &payload(json!({"amount": 1}))).await.unwrap();

        let worker = SyncWorker::new(workers.clone(), "Ledger", &SchedulerSettings::default());
        worker.stop();

        let summary = tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("worker ignored an early stop")
            .unwrap();
        assert_eq!(summary, SyncSummary { processed: 0, failed: 0 });
        assert!(seen.lock().is_empty());
        assert_eq!(workers.pending("Ledger").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_non_job_names() {
        let workers = workers(Arc::new(Mutex::new(Vec::new())));
        let settings = SchedulerSettings::default();

        let err = SyncWorker::new(workers.clone(), "Missing", &settings).run().await.unwrap_err();
        assert!(matches!(err, JobError::JobNotFound(_)));

        let err = SyncWorker::new(workers, "Idle", &settings).run().await.unwrap_err();
        assert!(matches!(err, JobError::InvalidWorkable(_)));
    }
}
