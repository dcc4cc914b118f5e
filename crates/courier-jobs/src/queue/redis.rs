//! Redis list-backed queue.
//!
//! `LPUSH` on push and `RPOP` on pop give FIFO order per list.

use super::QueueBackend;
use crate::error::{JobError, JobResult};
use crate::payload::{encode_payload, Payload, QueueMessage};
use async_trait::async_trait;
use courier_config::{QueueDriver, RedisSettings};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use tracing::{debug, error, info};

/// Create a Redis connection pool.
pub async fn create_pool(settings: &RedisSettings) -> JobResult<Pool> {
    info!(
        host = %settings.host,
        database = settings.database,
        "Creating Redis connection pool for job queues..."
    );

    let cfg = Config::from_url(settings.connection_url());

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(settings.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool
        .get()
        .await
        .map_err(|e| JobError::BackendUnavailable(format!("Redis connection failed: {}", e)))?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Queue backed by one Redis list per queue name.
pub struct RedisQueue {
    pool: Pool,
    prefix: String,
}

impl RedisQueue {
    /// Creates a queue over an existing pool.
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| JobError::BackendUnavailable(format!("Redis connection failed: {}", e)))
    }

    async fn try_push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        let body = encode_payload(payload)?;
        let mut conn = self.conn().await?;
        let _: i64 = conn.lpush(queue, body).await?;
        Ok(())
    }

    async fn try_pop(&self, queue: &str) -> JobResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.rpop(queue, None).await?)
    }

    async fn try_size(&self, queue: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(queue).await?)
    }

    async fn try_clear(&self, queue: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.del(queue).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn driver(&self) -> QueueDriver {
        QueueDriver::Redis
    }

    fn queue_prefix(&self) -> &str {
        &self.prefix
    }

    async fn push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        match self.try_push(queue, payload).await {
            Ok(()) => {
                debug!(queue = %queue, "Pushed payload to Redis list");
                Ok(())
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to push payload to Redis list");
                Err(match e {
                    JobError::Serialization(_) => e,
                    other => JobError::BackendUnavailable(other.to_string()),
                })
            }
        }
    }

    async fn pop(&self, queue: &str) -> Option<QueueMessage> {
        match self.try_pop(queue).await {
            Ok(Some(body)) => {
                debug!(queue = %queue, bytes = body.len(), "Popped payload from Redis list");
                Some(QueueMessage::Encoded(body))
            }
            Ok(None) => None,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to pop from Redis list");
                None
            }
        }
    }

    async fn size(&self, queue: &str) -> u64 {
        self.try_size(queue).await.unwrap_or_else(|e| {
            error!(queue = %queue, error = %e, "Failed to read Redis list length");
            0
        })
    }

    async fn clear(&self, queue: &str) {
        match self.try_clear(queue).await {
            Ok(()) => info!(queue = %queue, "Cleared Redis list"),
            Err(e) => error!(queue = %queue, error = %e, "Failed to clear Redis list"),
        }
    }
}
