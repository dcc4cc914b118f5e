//! AMQP broker-backed queue.
//!
//! Queues are declared durable, non-exclusive and non-auto-delete the first
//! time they are used on a channel. Channels run in confirm mode, so a push
//! only succeeds once the broker acks the publish. A pop is a `basic.get`
//! followed by an immediate ack, so a popped message is never redelivered.

use super::QueueBackend;
use crate::error::{JobError, JobResult};
use crate::payload::{encode_payload, Payload, QueueMessage};
use async_trait::async_trait;
use courier_config::{AmqpSettings, QueueDriver};
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Queue backed by an AMQP broker.
///
/// The connection is opened lazily and reopened before the next operation
/// whenever the broker dropped it.
pub struct AmqpQueue {
    settings: AmqpSettings,
    prefix: String,
    session: Mutex<Option<Session>>,
}

impl AmqpQueue {
    /// Creates a queue without connecting.
    pub fn new(settings: AmqpSettings, prefix: impl Into<String>) -> Self {
        Self {
            settings,
            prefix: prefix.into(),
            session: Mutex::new(None),
        }
    }

    /// Opens the connection now instead of on first use.
    pub async fn connect(&self) -> JobResult<()> {
        let mut session = self.session.lock().await;
        Self::ensure_session(&self.settings, &mut session).await?;
        Ok(())
    }

    async fn ensure_session<'a>(settings: &AmqpSettings, slot: &'a mut Option<Session>) -> JobResult<&'a mut Session> {
        if slot.as_ref().is_some_and(|s| !s.is_open()) {
            warn!(broker = %settings.display_addr(), "AMQP connection lost, reconnecting");
            *slot = None;
        }

        if slot.is_none() {
            *slot = Some(Self::open_session(settings).await?);
        }

        slot.as_mut()
            .ok_or_else(|| JobError::Internal("AMQP session missing after connect".to_string()))
    }

    async fn open_session(settings: &AmqpSettings) -> JobResult<Session> {
        let addr = settings.display_addr();
        let connect = Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default());

        let connection = match tokio::time::timeout(settings.connection_timeout(), connect).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                error!(broker = %addr, error = %e, "Failed to connect to AMQP broker");
                return Err(JobError::BackendUnavailable(format!("{}: {}", addr, e)));
            }
            Err(_) => {
                error!(broker = %addr, timeout_secs = settings.connection_timeout_secs, "AMQP connection timed out");
                return Err(JobError::BackendUnavailable(format!("{}: connection timed out", addr)));
            }
        };

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| JobError::BackendUnavailable(format!("{}: failed to open channel: {}", addr, e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| JobError::BackendUnavailable(format!("{}: failed to enable publisher confirms: {}", addr, e)))?;

        info!(broker = %addr, "Connected to AMQP broker");

        Ok(Session {
            connection,
            channel,
            declared: HashSet::new(),
        })
    }

    /// Declares the queue if this session has not yet, returning its message count.
    async fn declare(session: &mut Session, queue: &str, force: bool) -> JobResult<u32> {
        if !force && session.declared.contains(queue) {
            return Ok(0);
        }

        let declared = session
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        session.declared.insert(queue.to_string());
        Ok(declared.message_count())
    }

    async fn try_push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        let body = encode_payload(payload)?;
        let mut slot = self.session.lock().await;
        let session = Self::ensure_session(&self.settings, &mut slot).await?;
        Self::declare(session, queue, false).await?;

        let confirmation = session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await?
            .await?;
        check_confirmation(queue, &confirmation)
    }

    async fn try_pop(&self, queue: &str) -> JobResult<Option<Vec<u8>>> {
        let mut slot = self.session.lock().await;
        let session = Self::ensure_session(&self.settings, &mut slot).await?;
        Self::declare(session, queue, false).await?;

        let Some(message) = session.channel.basic_get(queue, BasicGetOptions::default()).await? else {
            return Ok(None);
        };
        message.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(Some(message.delivery.data))
    }

    async fn try_size(&self, queue: &str) -> JobResult<u64> {
        let mut slot = self.session.lock().await;
        let session = Self::ensure_session(&self.settings, &mut slot).await?;
        Ok(u64::from(Self::declare(session, queue, true).await?))
    }

    async fn try_clear(&self, queue: &str) -> JobResult<u32> {
        let mut slot = self.session.lock().await;
        let session = Self::ensure_session(&self.settings, &mut slot).await?;
        Self::declare(session, queue, false).await?;
        Ok(session.channel.queue_purge(queue, QueuePurgeOptions::default()).await?)
    }
}

#[async_trait]
impl QueueBackend for AmqpQueue {
    fn driver(&self) -> QueueDriver {
        QueueDriver::Amqp
    }

    fn queue_prefix(&self) -> &str {
        &self.prefix
    }

    async fn push(&self, queue: &str, payload: &Payload) -> JobResult<()> {
        match self.try_push(queue, payload).await {
            Ok(()) => {
                debug!(queue = %queue, "Published payload to AMQP queue");
                Ok(())
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to publish payload to AMQP queue");
                Err(match e {
                    JobError::Serialization(_) | JobError::BackendUnavailable(_) => e,
                    other => JobError::BackendUnavailable(other.to_string()),
                })
            }
        }
    }

    async fn pop(&self, queue: &str) -> Option<QueueMessage> {
        match self.try_pop(queue).await {
            Ok(Some(body)) => {
                debug!(queue = %queue, bytes = body.len(), "Received payload from AMQP queue");
                Some(QueueMessage::Encoded(body))
            }
            Ok(None) => None,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to get message from AMQP queue");
                None
            }
        }
    }

    async fn size(&self, queue: &str) -> u64 {
        self.try_size(queue).await.unwrap_or_else(|e| {
            error!(queue = %queue, error = %e, "Failed to read AMQP queue size");
            0
        })
    }

    async fn clear(&self, queue: &str) {
        match self.try_clear(queue).await {
            Ok(purged) => info!(queue = %queue, purged, "Purged AMQP queue"),
            Err(e) => error!(queue = %queue, error = %e, "Failed to purge AMQP queue"),
        }
    }
}

/// A publish counts only when the broker acked it.
fn check_confirmation(queue: &str, confirmation: &Confirmation) -> JobResult<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(JobError::BackendUnavailable(format!(
            "broker rejected publish to {}",
            queue
        ))),
        Confirmation::NotRequested => Err(JobError::BackendUnavailable(format!(
            "publish to {} was not confirmed",
            queue
        ))),
    }
}

fn amqp_uri(settings: &AmqpSettings) -> AMQPUri {
    let mut uri = AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.user.clone(),
                password: settings.password.clone(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.vhost.clone(),
        ..AMQPUri::default()
    };
    uri.query.connection_timeout = u64::try_from(settings.connection_timeout().as_millis()).ok();
    uri
}
