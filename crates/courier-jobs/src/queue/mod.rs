//! Queue backend abstraction.
//!
//! A backend stores pending payloads per queue name and hands them out one
//! at a time. Consumers poll with [`QueueBackend::pop`]; nothing blocks
//! waiting for a message.
//!
//! Failure policy: `pop`, `size` and `clear` log backend faults and degrade
//! to `None`, `0` and a no-op. `push` logs the fault and also returns it, so
//! a producer can tell a dropped payload from a stored one.

mod amqp;
mod memory;
mod redis;

pub use self::amqp::AmqpQueue;
pub use self::memory::InMemoryQueue;
pub use self::redis::{create_pool, RedisQueue};

use crate::error::JobResult;
use crate::payload::{Payload, QueueMessage};
use async_trait::async_trait;
use courier_config::{QueueDriver, QueueSettings};
use std::sync::Arc;
use tracing::info;

/// Uniform push/pop/size/clear contract over a queue store.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Driver backing this queue.
    fn driver(&self) -> QueueDriver;

    /// Namespacing prefix applied to derived queue names.
    fn queue_prefix(&self) -> &str;

    /// Enqueues a payload.
    async fn push(&self, queue: &str, payload: &Payload) -> JobResult<()>;

    /// Dequeues one message, or `None` when the queue is empty or unreachable.
    async fn pop(&self, queue: &str) -> Option<QueueMessage>;

    /// Number of pending messages; `0` when unreachable.
    async fn size(&self, queue: &str) -> u64;

    /// Purges every pending message.
    async fn clear(&self, queue: &str);
}

/// Builds the backend selected by `queue.driver`.
///
/// Durable drivers connect eagerly so that an unreachable backend fails
/// startup instead of the first job.
pub async fn select_backend(settings: &QueueSettings) -> JobResult<Arc<dyn QueueBackend>> {
    info!(driver = %settings.driver, prefix = %settings.prefix, "Selecting queue backend");

    let backend: Arc<dyn QueueBackend> = match settings.driver {
        QueueDriver::Amqp => {
            let queue = AmqpQueue::new(settings.connections.amqp.clone(), settings.prefix.clone());
            queue.connect().await?;
            Arc::new(queue)
        }
        QueueDriver::Redis => {
            let pool = create_pool(&settings.connections.redis).await?;
            Arc::new(RedisQueue::new(pool, settings.prefix.clone()))
        }
        QueueDriver::Memory => Arc::new(InMemoryQueue::new(settings.prefix.clone())),
    };

    Ok(backend)
}
