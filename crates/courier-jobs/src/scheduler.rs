//! Bounded-concurrency scheduler for async jobs.
//!
//! For each job name the manager keeps a pool of at most `max_concurrency`
//! in-flight executions. A pool is refilled three ways: the initial
//! dispatch burst, a self-refill after every terminal outcome, and a
//! periodic probe that catches payloads pushed while the pool was idle.
//!
//! Every dispatched execution owns one record in its pool's execution
//! table. The record is removed exactly once, by whichever terminal branch
//! (success, failure or timeout) gets there, and `running` is the size of
//! that table, so a double decrement or a leaked slot cannot happen.
//!
//! Cancellation is cooperative. A timed-out or stopped execution is
//! detached from the scheduler's bookkeeping but its task is not aborted.

use crate::error::{JobError, JobResult};
use crate::job::{AsyncJob, AsyncJobConfig, Job};
use crate::metrics::JobMetrics;
use crate::payload::{Payload, LAST_ERROR_KEY};
use crate::registry::WorkableKind;
use crate::retry::{FailureKind, RequeuePolicy, RetryDecision};
use crate::worker::WorkerManager;
use chrono::{DateTime, Utc};
use courier_config::SchedulerSettings;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifier of one dispatched execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// An in-flight execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub job_name: String,
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
}

/// Per-job statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStats {
    /// In-flight executions.
    pub running: usize,
    /// Executions that succeeded.
    pub completed: u64,
    /// Executions that failed, timeouts included.
    pub failed: u64,
    /// Failed executions that were timeouts.
    pub timed_out: u64,
    /// Payloads pushed back for retry.
    pub retried: u64,
    /// Payloads dropped after their last retry.
    pub exhausted: u64,
    /// Retries lost because the requeue push failed.
    pub retry_dropped: u64,
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub retry_enabled: bool,
    pub max_retries: u32,
}

impl JobStats {
    fn new(config: &AsyncJobConfig) -> Self {
        Self {
            running: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            retried: 0,
            exhausted: 0,
            retry_dropped: 0,
            max_concurrency: config.max_concurrency,
            timeout_secs: config.timeout.as_secs(),
            retry_enabled: config.retry_enabled,
            max_retries: config.max_retries,
        }
    }

    /// Fraction of the pool in use, from 0.0 to 1.0.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 0.0;
        }
        self.running as f64 / self.max_concurrency as f64
    }

    /// Executions that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }
}

enum Admission {
    Dispatch {
        id: ExecutionId,
        job: Box<dyn AsyncJob>,
        payload: Payload,
        running: usize,
        config: AsyncJobConfig,
    },
    Return(Payload, &'static str),
    Idle,
}

enum Outcome {
    Succeeded,
    Failed(JobError),
    TimedOut(Duration),
}

struct JobPool {
    generation: u64,
    config: AsyncJobConfig,
    policy: RequeuePolicy,
    stats: JobStats,
    /// Slots reserved by dispatches that are still popping.
    claims: usize,
    executions: HashMap<ExecutionId, ExecutionRecord>,
    supervisors: HashMap<ExecutionId, AbortHandle>,
    timers: Vec<JoinHandle<()>>,
}

impl JobPool {
    fn occupied(&self) -> usize {
        self.executions.len() + self.claims
    }

    fn snapshot(&self) -> JobStats {
        JobStats {
            running: self.executions.len(),
            ..self.stats.clone()
        }
    }
}

struct Inner {
    workers: WorkerManager,
    probe_interval: Duration,
    stats_interval: Duration,
    pools: Mutex<HashMap<String, JobPool>>,
    generations: AtomicU64,
}

/// Runs async jobs with per-name concurrency limits, timeouts and retries.
#[derive(Clone)]
pub struct AsyncJobManager {
    inner: Arc<Inner>,
}

impl AsyncJobManager {
    pub fn new(workers: WorkerManager, settings: &SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                workers,
                probe_interval: settings.probe_interval(),
                stats_interval: settings.stats_interval(),
                pools: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn workers(&self) -> &WorkerManager {
        &self.inner.workers
    }

    /// Starts processing a registered async job.
    ///
    /// Dispatches up to `max_concurrency` executions right away, then keeps
    /// the pool full with a periodic probe and reports stats periodically.
    /// Restarting a name that is already processing resets its stats.
    pub async fn start_async_processing(&self, name: &str, template: &dyn AsyncJob) -> JobResult<()> {
        let entry = self
            .inner
            .workers
            .registry()
            .get(name)
            .ok_or_else(|| JobError::JobNotFound(name.to_string()))?;
        if entry.kind() != WorkableKind::AsyncJob {
            return Err(JobError::InvalidWorkable(format!(
                "{} is a {}, not an async job",
                name,
                entry.kind()
            )));
        }

        let config = template.config();
        config.validate()?;
        if !config.is_async {
            return Err(JobError::InvalidWorkable(format!(
                "{} is not configured as async; run it on the synchronous worker",
                name
            )));
        }

        if self.stop_processing(name) {
            warn!(job_name = %name, "Async processing restarted");
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let pool = JobPool {
            generation,
            policy: RequeuePolicy::from(&config),
            stats: JobStats::new(&config),
            config: config.clone(),
            claims: 0,
            executions: HashMap::new(),
            supervisors: HashMap::new(),
            timers: Vec::new(),
        };
        self.inner.pools.lock().insert(name.to_string(), pool);

        info!(
            job_name = %name,
            max_concurrency = config.max_concurrency,
            timeout_secs = config.timeout.as_secs_f64(),
            retry_enabled = config.retry_enabled,
            max_retries = config.max_retries,
            "Starting async job processing"
        );

        for _ in 0..config.max_concurrency {
            if !self.process_next_job(name).await {
                break;
            }
        }

        let probe = self.spawn_probe(name.to_string(), generation);
        let stats = self.spawn_stats_reporter(name.to_string(), generation);

        let mut pools = self.inner.pools.lock();
        match pools.get_mut(name).filter(|p| p.generation == generation) {
            Some(pool) => pool.timers.extend([probe, stats]),
            None => {
                probe.abort();
                stats.abort();
            }
        }
        Ok(())
    }

    /// Attempts to dispatch one execution of `name`.
    ///
    /// Returns true if a payload was popped and its execution started. A
    /// full pool, an empty queue or a stopped name are all no-ops.
    pub fn process_next_job(&self, name: &str) -> BoxFuture<'static, bool> {
        let this = self.clone();
        let name = name.to_string();
        Box::pin(async move { this.dispatch(name).await })
    }

    async fn dispatch(self, name: String) -> bool {
        let generation = {
            let mut pools = self.inner.pools.lock();
            let Some(pool) = pools.get_mut(&name) else {
                return false;
            };
            if pool.occupied() >= pool.config.max_concurrency {
                debug!(
                    job_name = %name,
                    running = pool.executions.len(),
                    max_concurrency = pool.config.max_concurrency,
                    "Pool full, not dispatching"
                );
                return false;
            }
            pool.claims += 1;
            pool.generation
        };

        let payload = self.inner.workers.next_job(&name).await;
        let job = payload.as_ref().and_then(|_| {
            self.inner
                .workers
                .registry()
                .get(&name)
                .and_then(|entry| entry.create_async_job())
        });

        let admission = {
            let mut pools = self.inner.pools.lock();
            let pool = pools.get_mut(&name).filter(|p| p.generation == generation).map(|pool| {
                pool.claims -= 1;
                pool
            });
            match (pool, payload, job) {
                (_, None, _) => Admission::Idle,
                (Some(pool), Some(payload), Some(job)) => {
                    let record = ExecutionRecord {
                        job_name: name.clone(),
                        execution_id: ExecutionId::new(),
                        started_at: Utc::now(),
                    };
                    let id = record.execution_id;
                    pool.executions.insert(id, record);
                    let running = pool.executions.len();
                    JobMetrics::job_dispatched(&name);
                    JobMetrics::update_pool(&name, running as u64, pool.config.max_concurrency);
                    Admission::Dispatch {
                        id,
                        job,
                        payload,
                        running,
                        config: pool.config.clone(),
                    }
                }
                (Some(_), Some(payload), None) => {
                    Admission::Return(payload, "No async job factory registered, returning payload to the queue")
                }
                (None, Some(payload), _) => {
                    Admission::Return(payload, "Processing stopped while popping, returning payload to the queue")
                }
            }
        };

        match admission {
            Admission::Dispatch {
                id,
                job,
                payload,
                running,
                config,
            } => {
                info!(
                    job_name = %name,
                    execution_id = %id,
                    job_id = %job.id(),
                    running,
                    max_concurrency = config.max_concurrency,
                    "Dispatched job execution"
                );
                let supervisor = tokio::spawn(self.clone().supervise(
                    name.clone(),
                    generation,
                    id,
                    job,
                    payload,
                    config.timeout,
                ));
                self.with_pool(&name, generation, |pool| {
                    if pool.executions.contains_key(&id) {
                        pool.supervisors.insert(id, supervisor.abort_handle());
                    }
                });
                true
            }
            Admission::Return(payload, reason) => {
                warn!(job_name = %name, "{}", reason);
                self.return_payload(&name, &payload).await;
                false
            }
            Admission::Idle => false,
        }
    }

    /// Pushes back a payload popped for a pool that went away meanwhile.
    async fn return_payload(&self, name: &str, payload: &Payload) {
        if let Err(e) = self.inner.workers.push_job(name, payload).await {
            error!(job_name = %name, error = %e, "Failed to return payload to the queue; it is lost");
        }
    }

    async fn supervise(
        self,
        name: String,
        generation: u64,
        id: ExecutionId,
        job: Box<dyn AsyncJob>,
        payload: Payload,
        timeout: Duration,
    ) {
        let started = Instant::now();
        let execution = tokio::spawn(job.execute_async(payload.clone()));

        let outcome = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(Ok(()))) => Outcome::Succeeded,
            Ok(Ok(Err(e))) => Outcome::Failed(e),
            Ok(Err(e)) if e.is_panic() => Outcome::Failed(JobError::ExecutionFailed("job panicked".to_string())),
            Ok(Err(e)) => Outcome::Failed(JobError::Internal(format!("job task failed: {}", e))),
            // Dropping the join handle detaches the job task; it is not aborted.
            Err(_) => Outcome::TimedOut(timeout),
        };

        self.finish(&name, generation, id, payload, outcome, started.elapsed()).await;
    }

    async fn finish(
        &self,
        name: &str,
        generation: u64,
        id: ExecutionId,
        payload: Payload,
        outcome: Outcome,
        elapsed: Duration,
    ) {
        let (policy, running) = {
            let mut pools = self.inner.pools.lock();
            let Some(pool) = pools.get_mut(name).filter(|p| p.generation == generation) else {
                debug!(job_name = %name, execution_id = %id, "Pool stopped, dropping execution outcome");
                return;
            };
            if pool.executions.remove(&id).is_none() {
                return;
            }
            pool.supervisors.remove(&id);
            match &outcome {
                Outcome::Succeeded => pool.stats.completed += 1,
                Outcome::Failed(_) => pool.stats.failed += 1,
                Outcome::TimedOut(_) => {
                    pool.stats.failed += 1;
                    pool.stats.timed_out += 1;
                }
            }
            JobMetrics::update_pool(name, pool.executions.len() as u64, pool.config.max_concurrency);
            (pool.policy, pool.executions.len())
        };

        let failure = match outcome {
            Outcome::Succeeded => {
                info!(
                    job_name = %name,
                    execution_id = %id,
                    duration_ms = elapsed.as_millis() as u64,
                    running,
                    "Job execution completed"
                );
                JobMetrics::job_completed(name, elapsed);
                None
            }
            Outcome::Failed(e) => {
                warn!(
                    job_name = %name,
                    execution_id = %id,
                    error = %e,
                    duration_ms = elapsed.as_millis() as u64,
                    running,
                    "Job execution failed"
                );
                JobMetrics::job_failed(name, e.kind(), elapsed);
                Some((FailureKind::Error, e.failure_message()))
            }
            Outcome::TimedOut(timeout) => {
                let e = JobError::ExecutionTimedOut(timeout);
                warn!(
                    job_name = %name,
                    execution_id = %id,
                    timeout_secs = timeout.as_secs_f64(),
                    running,
                    "Job execution timed out"
                );
                JobMetrics::job_failed(name, e.kind(), elapsed);
                JobMetrics::job_timed_out(name);
                Some((FailureKind::Timeout, e.failure_message()))
            }
        };

        if let Some((kind, message)) = failure {
            self.apply_retry(name, generation, &policy, &payload, kind, &message).await;
        }

        self.process_next_job(name).await;
    }

    async fn apply_retry(
        &self,
        name: &str,
        generation: u64,
        policy: &RequeuePolicy,
        payload: &Payload,
        kind: FailureKind,
        message: &str,
    ) {
        match policy.decide(payload, kind, message) {
            RetryDecision::Requeue { payload, attempt } => match self.inner.workers.push_job(name, &payload).await {
                Ok(()) => {
                    self.with_pool(name, generation, |pool| pool.stats.retried += 1);
                    JobMetrics::job_retried(name, attempt);
                    info!(
                        job_name = %name,
                        attempt,
                        max_retries = policy.max_retries,
                        "Requeued failed job payload for retry"
                    );
                }
                Err(e) => {
                    self.with_pool(name, generation, |pool| pool.stats.retry_dropped += 1);
                    JobMetrics::job_retry_dropped(name);
                    error!(job_name = %name, attempt, error = %e, "Failed to requeue job payload; retry dropped");
                }
            },
            RetryDecision::Exhausted { attempts } => {
                self.with_pool(name, generation, |pool| pool.stats.exhausted += 1);
                JobMetrics::job_exhausted(name);
                error!(
                    job_name = %name,
                    attempts,
                    max_retries = policy.max_retries,
                    last_error = %message,
                    previous_error = ?payload.get(LAST_ERROR_KEY),
                    "Job payload failed permanently, retries exhausted"
                );
            }
            RetryDecision::Disabled => {}
        }
    }

    fn with_pool(&self, name: &str, generation: u64, update: impl FnOnce(&mut JobPool)) {
        let mut pools = self.inner.pools.lock();
        if let Some(pool) = pools.get_mut(name).filter(|p| p.generation == generation) {
            update(pool);
        }
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.inner
            .pools
            .lock()
            .get(name)
            .is_some_and(|p| p.generation == generation)
    }

    fn spawn_probe(&self, name: String, generation: u64) -> JoinHandle<()> {
        let every = self.inner.probe_interval;
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = Self::upgrade(&inner) else {
                    break;
                };
                if !manager.is_current(&name, generation) {
                    break;
                }
                manager.process_next_job(&name).await;
            }
        })
    }

    fn spawn_stats_reporter(&self, name: String, generation: u64) -> JoinHandle<()> {
        let every = self.inner.stats_interval;
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = Self::upgrade(&inner) else {
                    break;
                };
                if !manager.is_current(&name, generation) {
                    break;
                }
                manager.report_stats(&name).await;
            }
        })
    }

    fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Logs and publishes the current stats of a job.
    pub async fn report_stats(&self, name: &str) -> Option<JobStats> {
        let stats = self.get_job_stats(name)?;
        let pending = self.inner.workers.pending(name).await;
        JobMetrics::update_pool(name, stats.running as u64, stats.max_concurrency);

        info!(
            job_name = %name,
            running = stats.running,
            max_concurrency = stats.max_concurrency,
            utilization_pct = (stats.utilization() * 10_000.0).round() / 100.0,
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            retried = stats.retried,
            exhausted = stats.exhausted,
            retry_dropped = stats.retry_dropped,
            pending,
            "Async job stats"
        );
        Some(stats)
    }

    /// Stops dispatching for `name` and discards its stats.
    ///
    /// Executions already running are detached, not cancelled. Returns
    /// false if the name was not processing.
    pub fn stop_processing(&self, name: &str) -> bool {
        let Some(pool) = self.inner.pools.lock().remove(name) else {
            return false;
        };

        for timer in &pool.timers {
            timer.abort();
        }
        for supervisor in pool.supervisors.values() {
            supervisor.abort();
        }

        info!(
            job_name = %name,
            detached = pool.executions.len(),
            "Stopped async job processing"
        );
        true
    }

    /// Stops every job name.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.inner.pools.lock().keys().cloned().collect();
        for name in names {
            self.stop_processing(&name);
        }
    }

    pub fn is_processing(&self, name: &str) -> bool {
        self.inner.pools.lock().contains_key(name)
    }

    pub fn get_job_stats(&self, name: &str) -> Option<JobStats> {
        self.inner.pools.lock().get(name).map(JobPool::snapshot)
    }

    pub fn get_all_job_stats(&self) -> HashMap<String, JobStats> {
        self.inner
            .pools
            .lock()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.snapshot()))
            .collect()
    }

    /// In-flight executions of a job, oldest first.
    pub fn executions(&self, name: &str) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .inner
            .pools
            .lock()
            .get(name)
            .map(|pool| pool.executions.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.started_at);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_from_config() {
        let config = AsyncJobConfig::asynchronous()
            .with_max_concurrency(4)
            .with_timeout(Duration::from_secs(10))
            .with_retries(2);
        let mut stats = JobStats::new(&config);
        assert_eq!(stats.max_concurrency, 4);
        assert_eq!(stats.timeout_secs, 10);
        assert!(stats.retry_enabled);
        assert_eq!(stats.max_retries, 2);
        assert_eq!(stats.utilization(), 0.0);

        stats.running = 3;
        assert!((stats.utilization() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finished_counts_completed_and_failed() {
        let mut stats = JobStats::new(&AsyncJobConfig::default());
        stats.completed = 4;
        stats.failed = 2;
        stats.timed_out = 1;
        assert_eq!(stats.finished(), 6);
    }

    #[test]
    fn test_execution_id_display() {
        let id = ExecutionId::new();
        assert_eq!(id.to_string().len(), 32);
        assert_ne!(id, ExecutionId::new());
    }
}
