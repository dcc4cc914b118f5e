//! Job contracts.
//!
//! A [`Job`] consumes one payload from its queue per execution. An
//! [`AsyncJob`] additionally declares how the scheduler may run it:
//! concurrency, timeout and retry policy. That declaration is fixed per job
//! type; every instance of a type must report the same [`AsyncJobConfig`].

use crate::error::{JobError, JobResult};
use crate::payload::Payload;
use crate::workable::Workable;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique job instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(format!("job_{}", Uuid::now_v7().simple()))
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A workable bound to a backing queue.
pub trait Job: Workable + 'static {
    /// Identifier generated at construction.
    fn id(&self) -> &JobId {
        self.state().id()
    }

    /// Backing queue name, `"<Name>_queue"` unless overridden.
    fn queue(&self) -> String {
        format!("{}_queue", self.name())
    }

    /// Processes one dequeued payload.
    fn execute(&mut self, payload: &Payload) -> JobResult<()>;
}

/// Scheduling metadata of an async job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncJobConfig {
    /// Run through the async scheduler rather than the synchronous loop.
    pub is_async: bool,
    /// Maximum in-flight executions, at least 1.
    pub max_concurrency: usize,
    /// Per-execution timeout, greater than zero.
    pub timeout: Duration,
    /// Requeue failed payloads.
    pub retry_enabled: bool,
    /// Requeues allowed per payload.
    pub max_retries: u32,
    /// Treat a timeout as a retryable failure.
    pub retry_on_timeout: bool,
}

impl Default for AsyncJobConfig {
    fn default() -> Self {
        Self {
            is_async: false,
            max_concurrency: 1,
            timeout: Duration::from_secs(30),
            retry_enabled: false,
            max_retries: 3,
            retry_on_timeout: false,
        }
    }
}

impl AsyncJobConfig {
    /// Scheduler-driven config with the default limits.
    pub fn asynchronous() -> Self {
        Self {
            is_async: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables retry-by-requeue with the given limit.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_enabled = true;
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    /// Rejects limits the scheduler cannot honor.
    pub fn validate(&self) -> JobResult<()> {
        if self.max_concurrency == 0 {
            return Err(JobError::InvalidWorkable("max_concurrency must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(JobError::InvalidWorkable("timeout must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// A job the scheduler can run concurrently, with a timeout and retries.
pub trait AsyncJob: Job {
    /// Scheduling metadata for this job type.
    fn config(&self) -> AsyncJobConfig;

    fn is_async(&self) -> bool {
        self.config().is_async
    }

    fn max_concurrency(&self) -> usize {
        self.config().max_concurrency
    }

    fn timeout(&self) -> Duration {
        self.config().timeout
    }

    fn should_retry(&self) -> bool {
        self.config().retry_enabled
    }

    fn max_retries(&self) -> u32 {
        self.config().max_retries
    }

    /// Runs the job to completion as a future.
    ///
    /// The default moves the blocking [`Job::execute`] onto the blocking
    /// thread pool so a slow job cannot stall other executions, their
    /// timeouts or the refill probe. Jobs doing async I/O should override
    /// this with a native future.
    fn execute_async(mut self: Box<Self>, payload: Payload) -> BoxFuture<'static, JobResult<()>> {
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || self.execute(&payload)).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(JobError::ExecutionFailed("job panicked".to_string())),
                Err(e) => Err(JobError::Internal(format!("blocking job task failed: {}", e))),
            }
        })
    }
}

/// A freshly built job, synchronous or async.
pub enum JobInstance {
    Sync(Box<dyn Job>),
    Async(Box<dyn AsyncJob>),
}

impl JobInstance {
    pub fn name(&self) -> &'static str {
        match self {
            JobInstance::Sync(job) => job.name(),
            JobInstance::Async(job) => job.name(),
        }
    }

    pub fn id(&self) -> &JobId {
        match self {
            JobInstance::Sync(job) => job.id(),
            JobInstance::Async(job) => job.id(),
        }
    }

    pub fn queue(&self) -> String {
        match self {
            JobInstance::Sync(job) => job.queue(),
            JobInstance::Async(job) => job.queue(),
        }
    }

    /// Runs [`Job::execute`] inline.
    pub fn execute(&mut self, payload: &Payload) -> JobResult<()> {
        match self {
            JobInstance::Sync(job) => job.execute(payload),
            JobInstance::Async(job) => job.execute(payload),
        }
    }

    /// Scheduling metadata, if this is an async job.
    pub fn async_config(&self) -> Option<AsyncJobConfig> {
        match self {
            JobInstance::Sync(_) => None,
            JobInstance::Async(job) => Some(job.config()),
        }
    }
}

impl fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobInstance")
            .field("name", &self.name())
            .field("id", self.id())
            .field("async", &matches!(self, JobInstance::Async(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workable::WorkableState;
    use serde_json::json;

    struct Thumbnail {
        state: WorkableState,
        seen: Vec<Payload>,
    }

    impl Thumbnail {
        fn new() -> Self {
            Self {
                state: WorkableState::new(),
                seen: Vec::new(),
            }
        }
    }

    impl Workable for Thumbnail {
        fn state(&self) -> &WorkableState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut WorkableState {
            &mut self.state
        }
    }

    impl Job for Thumbnail {
        fn execute(&mut self, payload: &Payload) -> JobResult<()> {
            if payload.contains_key("broken") {
                return Err(JobError::failed("cannot decode image"));
            }
            self.seen.push(payload.clone());
            Ok(())
        }
    }

    impl AsyncJob for Thumbnail {
        fn config(&self) -> AsyncJobConfig {
            AsyncJobConfig::asynchronous().with_max_concurrency(4).with_retries(2)
        }
    }

    #[test]
    fn test_default_queue_name() {
        let job = Thumbnail::new();
        assert_eq!(job.queue(), "Thumbnail_queue");
        assert!(job.id().as_str().starts_with("job_"));
    }

    #[test]
    fn test_async_config_defaults() {
        let config = AsyncJobConfig::default();
        assert!(!config.is_async);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(!config.retry_enabled);
        assert_eq!(config.max_retries, 3);
        assert!(!config.retry_on_timeout);
    }

    #[test]
    fn test_accessors_follow_config() {
        let job = Thumbnail::new();
        assert!(job.is_async());
        assert_eq!(job.max_concurrency(), 4);
        assert_eq!(job.timeout(), Duration::from_secs(30));
        assert!(job.should_retry());
        assert_eq!(job.max_retries(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(AsyncJobConfig::asynchronous().with_max_concurrency(0).validate().is_err());
        assert!(AsyncJobConfig::asynchronous().with_timeout(Duration::ZERO).validate().is_err());
        assert!(AsyncJobConfig::asynchronous().validate().is_ok());
    }

    #[tokio::test]
    async fn test_default_execute_async_bridges_blocking_execute() {
        let payload = json!({"image": "a.png"}).as_object().cloned().unwrap();
        tokio_test::assert_ok!(Box::new(Thumbnail::new()).execute_async(payload).await);

        let broken = json!({"broken": true}).as_object().cloned().unwrap();
        let err = Box::new(Thumbnail::new()).execute_async(broken).await.unwrap_err();
        assert_eq!(err.failure_message(), "cannot decode image");
    }

    #[test]
    fn test_instance_dispatches_execute() {
        let mut instance = JobInstance::Async(Box::new(Thumbnail::new()));
        assert_eq!(instance.name(), "Thumbnail");
        assert_eq!(instance.queue(), "Thumbnail_queue");
        assert!(instance.execute(&Payload::new()).is_ok());
        assert_eq!(instance.async_config().map(|c| c.max_concurrency), Some(4));
    }
}
