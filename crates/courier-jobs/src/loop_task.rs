//! Tick-driven loop tasks.
//!
//! A [`LoopTask`] is long-lived async work driven by a timer rather than a
//! queue. [`LoopTaskRunner`] calls `process_loop` on every tick, reports
//! uptime periodically and runs `cleanup` when told to shut down.

use crate::error::JobResult;
use crate::metrics::TaskMetrics;
use crate::workable::{Options, Workable};
use async_trait::async_trait;
use courier_config::SchedulerSettings;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info};

/// Async work repeated on a fixed tick.
#[async_trait]
pub trait LoopTask: Workable {
    /// Options applied before any set on the command line.
    fn default_options(&self) -> Options {
        Options::new()
    }

    async fn initialize(&mut self) -> JobResult<()> {
        Ok(())
    }

    /// One tick of work. An error stops the task.
    async fn process_loop(&mut self) -> JobResult<()>;

    async fn cleanup(&mut self) -> JobResult<()> {
        Ok(())
    }

    /// Extra fields for the periodic metrics report.
    fn metrics(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Summary of a finished loop task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u64,
    pub uptime: Duration,
}

/// Drives a [`LoopTask`] until shutdown or failure.
pub struct LoopTaskRunner {
    tick: Duration,
    metrics_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    /// Subscribed at construction so a stop sent before `run` is kept.
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
    iterations: Arc<AtomicU64>,
}

impl LoopTaskRunner {
    pub fn new(settings: &SchedulerSettings) -> Self {
        Self::with_intervals(settings.task_tick(), settings.task_metrics_interval())
    }

    pub fn with_intervals(tick: Duration, metrics_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            tick,
            metrics_interval,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            iterations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sender that stops the runner when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn stop(&self) {
        info!("Stopping loop task runner...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Runs the task until a shutdown signal, `destroy` or a failing tick.
    ///
    /// `cleanup` runs on every exit path once `initialize` has succeeded.
    pub async fn run(&self, task: &mut dyn LoopTask) -> JobResult<LoopSummary> {
        let mut shutdown_rx = self.shutdown_rx.lock().take().unwrap_or_else(|| self.shutdown_tx.subscribe());
        let name = task.name();
        let started = Instant::now();

        let mut options = task.default_options();
        options.extend(task.options().clone());
        task.set_options(options);

        if let Err(e) = task.initialize().await {
            error!(task = name, error = %e, "Loop task failed to initialize");
            task.destroy();
            return Err(e);
        }

        info!(
            task = name,
            id = %task.state().id(),
            tick_ms = self.tick.as_millis() as u64,
            "Loop task started"
        );

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut metrics = tokio::time::interval_at(started + self.metrics_interval, self.metrics_interval);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!(task = name, "Received shutdown signal");
                    break Ok(());
                }

                _ = metrics.tick() => {
                    self.report(task, started.elapsed());
                }

                _ = ticker.tick() => {
                    if !task.state().is_running() {
                        break Ok(());
                    }
                    if let Err(e) = task.process_loop().await {
                        error!(task = name, error = %e, "Loop task iteration failed");
                        break Err(e);
                    }
                    self.iterations.fetch_add(1, Ordering::Relaxed);
                    TaskMetrics::iteration(name);
                }
            }
        };

        if let Err(e) = task.cleanup().await {
            error!(task = name, error = %e, "Loop task cleanup failed");
        }
        task.destroy();

        let summary = LoopSummary {
            iterations: self.iterations(),
            uptime: started.elapsed(),
        };
        info!(
            task = name,
            iterations = summary.iterations,
            uptime_secs = summary.uptime.as_secs(),
            "Loop task stopped"
        );
        outcome.map(|()| summary)
    }

    fn report(&self, task: &dyn LoopTask, uptime: Duration) {
        let name = task.name();
        TaskMetrics::uptime(name, uptime);
        let extra = Value::Object(task.metrics());
        info!(
            task = name,
            uptime_secs = uptime.as_secs(),
            iterations = self.iterations(),
            metrics = %extra,
            "Task metrics"
        );
    }
}
