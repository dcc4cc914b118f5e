//! Courier Jobs - Queue-Backed Job Processing Engine
//!
//! Pulls payloads from a message queue and runs them through named units of
//! work:
//! - Pluggable queue backends (AMQP broker, Redis list, in-memory)
//! - Name-based registry of tasks, loop tasks, jobs and async jobs
//! - Bounded-concurrency async scheduler with timeouts and retry-by-requeue
//! - Synchronous worker loop for jobs that are not async
//!
//! # Architecture
//!
//! ```text
//!   push_job(name, payload)
//!          │
//!          ▼
//!  ┌──────────────────┐      ┌────────────────────┐
//!  │  WorkerManager   │─────▶│   QueueBackend     │  amqp | redis | memory
//!  │  (name → queue)  │◀─────│  push / pop / size │
//!  └────────┬─────────┘      └────────────────────┘
//!           │ next_job(name)
//!     ┌─────┴───────────────────────┐
//!     ▼                             ▼
//!  ┌──────────────┐        ┌─────────────────────────────┐
//!  │  SyncWorker  │        │       AsyncJobManager        │
//!  │  pop, run,   │        │  pool per name, ≤ max slots  │
//!  │  sleep       │        │  timeout → failed            │
//!  └──────────────┘        │  failure → requeue w/ count  │
//!                          │  refill on finish + probe    │
//!                          └─────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_jobs::prelude::*;
//!
//! struct ResizeImage {
//!     state: WorkableState,
//! }
//!
//! impl Workable for ResizeImage {
//!     fn state(&self) -> &WorkableState { &self.state }
//!     fn state_mut(&mut self) -> &mut WorkableState { &mut self.state }
//! }
//!
//! impl Job for ResizeImage {
//!     fn execute(&mut self, payload: &Payload) -> JobResult<()> {
//!         // resize payload["path"]
//!         Ok(())
//!     }
//! }
//!
//! impl AsyncJob for ResizeImage {
//!     fn config(&self) -> AsyncJobConfig {
//!         AsyncJobConfig::asynchronous().with_max_concurrency(4).with_retries(2)
//!     }
//! }
//!
//! registry.register(WorkableEntry::async_job(|| ResizeImage { state: WorkableState::new() }))?;
//! manager.start_async_processing("ResizeImage", &ResizeImage { state: WorkableState::new() }).await?;
//! ```

pub mod error;
pub mod job;
pub mod loop_task;
pub mod metrics;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod sync_worker;
pub mod workable;
pub mod worker;

pub use error::{JobError, JobResult};
pub use job::{AsyncJob, AsyncJobConfig, Job, JobId, JobInstance};
pub use loop_task::{LoopSummary, LoopTask, LoopTaskRunner};
pub use metrics::{register_metrics, JobMetrics, TaskMetrics};
pub use payload::{decode_payload, encode_payload, Payload, QueueMessage, LAST_ERROR_KEY, RETRY_COUNT_KEY};
pub use queue::{select_backend, AmqpQueue, InMemoryQueue, QueueBackend, RedisQueue};
pub use registry::{Catalog, WorkableEntry, WorkableKind, WorkableRegistry};
pub use retry::{FailureKind, RequeuePolicy, RetryDecision};
pub use scheduler::{AsyncJobManager, ExecutionId, ExecutionRecord, JobStats};
pub use sync_worker::{SyncSummary, SyncWorker};
pub use workable::{Options, StopHandle, Task, Workable, WorkableState};
pub use worker::WorkerManager;

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::job::{AsyncJob, AsyncJobConfig, Job};
    pub use crate::loop_task::LoopTask;
    pub use crate::payload::Payload;
    pub use crate::queue::QueueBackend;
    pub use crate::registry::WorkableEntry;
    pub use crate::workable::{Options, Task, Workable, WorkableState};
    pub use crate::{JobError, JobResult};
}
