//! Queue driver and connection configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Queue backend selected by `queue.driver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueDriver {
    /// AMQP broker (RabbitMQ).
    #[default]
    #[serde(alias = "rabbitmq", alias = "broker")]
    Amqp,
    /// Redis lists.
    #[serde(alias = "list")]
    Redis,
    /// Process-local queues, lost on exit.
    Memory,
}

impl QueueDriver {
    /// Returns true if payloads survive a process restart.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        matches!(self, Self::Amqp | Self::Redis)
    }
}

impl fmt::Display for QueueDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp => write!(f, "amqp"),
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// The `queue` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Backend driver.
    #[serde(default)]
    pub driver: QueueDriver,

    /// Prefix prepended to every derived queue name.
    #[serde(default)]
    pub prefix: String,

    /// Per-driver connection parameters.
    #[serde(default)]
    pub connections: ConnectionSettings,

    /// Job names to register at startup.
    #[serde(default)]
    pub jobs: Vec<String>,

    /// Worker presets started by `supervise`.
    #[serde(default)]
    pub workers: Vec<WorkerPreset>,
}

/// Connection parameters for every supported driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default, alias = "rabbitmq")]
    pub amqp: AmqpSettings,

    #[serde(default)]
    pub redis: RedisSettings,
}

/// AMQP broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpSettings {
    #[serde(default = "default_amqp_host")]
    pub host: String,

    #[serde(default = "default_amqp_port")]
    pub port: u16,

    #[serde(default = "default_amqp_credential")]
    pub user: String,

    #[serde(default = "default_amqp_credential")]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connection_timeout_secs: u64,
}

fn default_amqp_host() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_amqp_credential() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: default_amqp_host(),
            port: default_amqp_port(),
            user: default_amqp_credential(),
            password: default_amqp_credential(),
            vhost: default_vhost(),
            connection_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl AmqpSettings {
    /// Returns the connection timeout.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Broker address without credentials, for logs.
    #[must_use]
    pub fn display_addr(&self) -> String {
        format!("amqp://{}:{}/{}", self.host, self.port, self.vhost.trim_start_matches('/'))
    }
}

/// Redis connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Full connection URL; takes precedence over the individual fields.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: i64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    8
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            database: 0,
            pool_size: default_pool_size(),
        }
    }
}

impl RedisSettings {
    /// Returns the connection URL, building it from the fields when `url` is unset.
    #[must_use]
    pub fn connection_url(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.database),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// A `{num_workers, queues}` preset, run by `courier-worker supervise`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPreset {
    /// Worker processes started per listed job.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Jobs to run, by job name or unprefixed queue name.
    #[serde(default)]
    pub queues: Vec<String>,
}

fn default_num_workers() -> usize {
    1
}
