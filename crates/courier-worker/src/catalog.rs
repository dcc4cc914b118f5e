//! Workable types compiled into the worker binary.
//!
//! Configuration selects which of these get registered through
//! `queue.jobs` and `tasks`.

use async_trait::async_trait;
use courier_jobs::prelude::*;
use courier_jobs::Catalog;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::info;

/// Default heartbeat period.
const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Builds the catalog of every built-in type.
pub fn builtin_catalog() -> Catalog {
    Catalog::new()
        .with(WorkableEntry::async_job(EchoJob::default))
        .with(WorkableEntry::job(LogJob::default))
        .with(WorkableEntry::task(HeartbeatTask::default))
        .with(WorkableEntry::loop_task(PulseTask::default))
}

fn interval_option(workable: &dyn Workable) -> Duration {
    let millis = workable
        .option("interval_ms")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INTERVAL_MS);
    Duration::from_millis(millis)
}

/// Async job that logs its payload.
#[derive(Default)]
pub struct EchoJob {
    state: WorkableState,
}

impl Workable for EchoJob {
    fn state(&self) -> &WorkableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WorkableState {
        &mut self.state
    }
}

impl Job for EchoJob {
    fn execute(&mut self, payload: &Payload) -> JobResult<()> {
        info!(job_id = %self.id(), payload = %serde_json::Value::Object(payload.clone()), "Echo");
        Ok(())
    }
}

impl AsyncJob for EchoJob {
    fn config(&self) -> AsyncJobConfig {
        AsyncJobConfig::asynchronous()
            .with_max_concurrency(4)
            .with_timeout(Duration::from_secs(10))
            .with_retries(2)
    }

    fn execute_async(self: Box<Self>, payload: Payload) -> BoxFuture<'static, JobResult<()>> {
        Box::pin(async move {
            if let Some(delay) = payload.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Some(message) = payload.get("fail").and_then(Value::as_str) {
                return Err(JobError::failed(message));
            }
            info!(job_id = %self.id(), payload = %serde_json::Value::Object(payload), "Echo");
            Ok(())
        })
    }
}

/// Synchronous job that logs its payload.
#[derive(Default)]
pub struct LogJob {
    state: WorkableState,
}

impl Workable for LogJob {
    fn state(&self) -> &WorkableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WorkableState {
        &mut self.state
    }
}

impl Job for LogJob {
    fn execute(&mut self, payload: &Payload) -> JobResult<()> {
        let level = payload.get("level").and_then(Value::as_str).unwrap_or("info");
        let message = payload.get("message").and_then(Value::as_str).unwrap_or_default();
        match level {
            "warn" => tracing::warn!(job_id = %self.id(), "{}", message),
            "error" => tracing::error!(job_id = %self.id(), "{}", message),
            _ => info!(job_id = %self.id(), "{}", message),
        }
        Ok(())
    }
}

/// Logs a heartbeat every `interval_ms`; stops after `beats` if set.
#[derive(Default)]
pub struct HeartbeatTask {
    state: WorkableState,
    beats: u64,
}

impl Workable for HeartbeatTask {
    fn state(&self) -> &WorkableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WorkableState {
        &mut self.state
    }
}

impl Task for HeartbeatTask {
    fn execute(&mut self) -> JobResult<()> {
        std::thread::sleep(interval_option(&*self));
        self.beats += 1;
        info!(task = self.name(), beat = self.beats, "Heartbeat");

        let limit = self.option("beats").and_then(|v| v.parse::<u64>().ok());
        if limit.is_some_and(|limit| self.beats >= limit) {
            self.destroy();
        }
        Ok(())
    }
}

/// Loop task that counts ticks and logs every `every` of them.
#[derive(Default)]
pub struct PulseTask {
    state: WorkableState,
    ticks: u64,
    started: Option<Instant>,
}

#[async_trait]
impl LoopTask for PulseTask {
    fn default_options(&self) -> Options {
        Options::from([("every".to_string(), "50".to_string())])
    }

    async fn initialize(&mut self) -> JobResult<()> {
        self.started = Some(Instant::now());
        Ok(())
    }

    async fn process_loop(&mut self) -> JobResult<()> {
        self.ticks += 1;
        let every = self.option("every").and_then(|v| v.parse::<u64>().ok()).unwrap_or(50).max(1);
        if self.ticks % every == 0 {
            info!(task = self.name(), ticks = self.ticks, "Pulse");
        }
        Ok(())
    }

    fn metrics(&self) -> Map<String, Value> {
        let mut metrics = Map::new();
        metrics.insert("ticks".to_string(), Value::from(self.ticks));
        if let Some(started) = self.started {
            metrics.insert("since_init_ms".to_string(), Value::from(started.elapsed().as_millis() as u64));
        }
        metrics
    }
}

impl Workable for PulseTask {
    fn state(&self) -> &WorkableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WorkableState {
        &mut self.state
    }
}
