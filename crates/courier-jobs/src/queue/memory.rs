//! In-memory queue.
//!
//! Suitable for development, tests and single-process deployments. Payloads
//! are kept structured and are lost when the process exits.

use super::QueueBackend;
use crate::error::JobResult;
use crate::payload::{Payload, QueueMessage};
use async_trait::async_trait;
use courier_config::QueueDriver;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// FIFO queues held in process memory.
#[derive(Default)]
pub struct InMemoryQueue {
    prefix: String,
    queues: Mutex<HashMap<String, VecDeque<Payload>>>,
}

impl InMemoryQueue {
    /// Creates an empty set of queues.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Copies the pending payloads of a queue, oldest first.
    pub fn snapshot(&self, queue: &str) -> Vec<Payload> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn driver(&self) -> QueueDriver {
        QueueDriver::Memory
    }

    fn queue_prefix(&self) -> &str {
        &self.prefix
    }

    async fn push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        let depth = {
            let mut queues = self.queues.lock();
            let pending = queues.entry(queue.to_string()).or_default();
            pending.push_back(payload.clone());
            pending.len()
        };
        debug!(queue = %queue, depth, "Pushed payload to memory queue");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Option<QueueMessage> {
        let payload = self.queues.lock().get_mut(queue)?.pop_front()?;
        debug!(queue = %queue, "Popped payload from memory queue");
        Some(QueueMessage::Structured(payload))
    }

    async fn size(&self, queue: &str) -> u64 {
        self.queues.lock().get(queue).map_or(0, |q| q.len() as u64)
    }

    async fn clear(&self, queue: &str) {
        self.queues.lock().remove(queue);
        debug!(queue = %queue, "Cleared memory queue");
    }
}
