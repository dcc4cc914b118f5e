//! Worker manager: name-based access to job queues.
//!
//! Resolves a job name through the registry to its queue and talks to the
//! backend. It does no concurrency control of its own; the synchronous
//! worker loop and the async scheduler both build on it.

use crate::error::{JobError, JobResult};
use crate::metrics::JobMetrics;
use crate::payload::Payload;
use crate::queue::QueueBackend;
use crate::registry::WorkableRegistry;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Stateless facade over the queue backend and the registry.
#[derive(Clone)]
pub struct WorkerManager {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<WorkableRegistry>,
}

impl WorkerManager {
    pub fn new(backend: Arc<dyn QueueBackend>, registry: Arc<WorkableRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<WorkableRegistry> {
        &self.registry
    }

    /// Full queue name for a registered job: backend prefix plus derived queue.
    pub fn queue_for(&self, name: &str) -> Option<String> {
        let queue = self.registry.get(name)?.queue()?;
        Some(format!("{}{}", self.backend.queue_prefix(), queue))
    }

    /// Pops the next payload for a job.
    ///
    /// Returns `None` when the name is unknown, the queue is empty or the
    /// message cannot be decoded; each case is logged.
    pub async fn next_job(&self, name: &str) -> Option<Payload> {
        let Some(queue) = self.queue_for(name) else {
            warn!(job_name = %name, "No job registered under this name");
            return None;
        };

        let message = self.backend.pop(&queue).await?;
        match message.into_payload() {
            Ok(payload) => {
                JobMetrics::job_popped(&queue, name);
                debug!(job_name = %name, queue = %queue, "Fetched next job payload");
                Some(payload)
            }
            Err(e) => {
                error!(job_name = %name, queue = %queue, error = %e, "Discarding undecodable queue message");
                None
            }
        }
    }

    /// Pushes a payload onto a job's queue.
    pub async fn push_job(&self, name: &str, payload: &Payload) -> JobResult<()> {
        let queue = self
            .queue_for(name)
            .ok_or_else(|| JobError::JobNotFound(name.to_string()))?;

        self.backend.push(&queue, payload).await?;
        JobMetrics::job_pushed(&queue, name);
        debug!(job_name = %name, queue = %queue, "Pushed job payload");
        Ok(())
    }

    /// Pending payloads for a job; `0` for unknown names.
    pub async fn pending(&self, name: &str) -> u64 {
        match self.queue_for(name) {
            Some(queue) => {
                let pending = self.backend.size(&queue).await;
                JobMetrics::update_queue_size(&queue, pending);
                pending
            }
            None => 0,
        }
    }

    /// Purges a job's queue.
    pub async fn clear(&self, name: &str) -> JobResult<()> {
        let queue = self
            .queue_for(name)
            .ok_or_else(|| JobError::JobNotFound(name.to_string()))?;
        self.backend.clear(&queue).await;
        Ok(())
    }
}
