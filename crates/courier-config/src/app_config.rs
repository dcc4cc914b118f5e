//! Application configuration structures.

use crate::{QueueDriver, QueueSettings};
use courier_core::{CourierError, CourierResult, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Queue driver, connections, registered jobs and worker presets.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Task names to register at startup.
    #[serde(default)]
    pub tasks: Vec<String>,

    /// Scheduler timing.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Logging configuration.
    #[serde(default)]
    pub observability: LoggingConfig,
}

impl AppConfig {
    /// Checks the invariants serde cannot express.
    pub fn validate(&self) -> CourierResult<()> {
        match self.queue.driver {
            QueueDriver::Amqp => {
                let amqp = &self.queue.connections.amqp;
                if amqp.host.trim().is_empty() {
                    return Err(CourierError::configuration("queue.connections.amqp.host is required"));
                }
                if amqp.port == 0 {
                    return Err(CourierError::configuration("queue.connections.amqp.port must be non-zero"));
                }
            }
            QueueDriver::Redis => {
                let redis = &self.queue.connections.redis;
                let has_url = redis.url.as_deref().is_some_and(|u| !u.trim().is_empty());
                if !has_url && redis.host.trim().is_empty() {
                    return Err(CourierError::configuration(
                        "queue.connections.redis needs either url or host",
                    ));
                }
                if redis.pool_size == 0 {
                    return Err(CourierError::configuration("queue.connections.redis.pool_size must be at least 1"));
                }
            }
            QueueDriver::Memory => {}
        }

        if let Some(name) = self.queue.jobs.iter().chain(&self.tasks).find(|n| n.trim().is_empty()) {
            return Err(CourierError::configuration(format!("Empty workable name in configuration: {:?}", name)));
        }

        if let Some(preset) = self.queue.workers.iter().find(|w| w.num_workers == 0) {
            return Err(CourierError::configuration(format!(
                "Worker preset for queues {:?} must have num_workers >= 1",
                preset.queues
            )));
        }

        self.scheduler.validate()
    }
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Scheduler and worker-loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Refill probe interval in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Statistics report interval in seconds.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Idle sleep of the synchronous worker loop in milliseconds.
    #[serde(default = "default_sync_poll_interval_ms")]
    pub sync_poll_interval_ms: u64,

    /// Tick of loop tasks in milliseconds.
    #[serde(default = "default_task_tick_ms")]
    pub task_tick_ms: u64,

    /// Loop task metrics interval in seconds.
    #[serde(default = "default_task_metrics_interval_secs")]
    pub task_metrics_interval_secs: u64,
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

fn default_stats_interval_secs() -> u64 {
    30
}

fn default_sync_poll_interval_ms() -> u64 {
    1_000
}

fn default_task_tick_ms() -> u64 {
    100
}

fn default_task_metrics_interval_secs() -> u64 {
    5
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            sync_poll_interval_ms: default_sync_poll_interval_ms(),
            task_tick_ms: default_task_tick_ms(),
            task_metrics_interval_secs: default_task_metrics_interval_secs(),
        }
    }
}

impl SchedulerSettings {
    /// Returns the refill probe interval.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Returns the statistics report interval.
    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Returns the idle sleep of the synchronous loop.
    #[must_use]
    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    /// Returns the loop task tick.
    #[must_use]
    pub fn task_tick(&self) -> Duration {
        Duration::from_millis(self.task_tick_ms)
    }

    /// Returns the loop task metrics interval.
    #[must_use]
    pub fn task_metrics_interval(&self) -> Duration {
        Duration::from_secs(self.task_metrics_interval_secs)
    }

    fn validate(&self) -> CourierResult<()> {
        let intervals = [
            ("probe_interval_ms", self.probe_interval_ms),
            ("stats_interval_secs", self.stats_interval_secs),
            ("sync_poll_interval_ms", self.sync_poll_interval_ms),
            ("task_tick_ms", self.task_tick_ms),
            ("task_metrics_interval_secs", self.task_metrics_interval_secs),
        ];
        match intervals.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(CourierError::configuration(format!("scheduler.{} must be greater than zero", key))),
            None => Ok(()),
        }
    }
}
