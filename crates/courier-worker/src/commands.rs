//! Command implementations.
//!
//! Long-running commands take a `shutdown` future and stop cleanly when it
//! resolves; the binary passes Ctrl+C/SIGTERM, tests pass a timer.

use crate::app::WorkerApp;
use crate::supervisor::{ProcessSpec, ProcessStatus, Supervisor};
use courier_core::{CourierError, CourierResult};
use courier_jobs::{AsyncJob, JobInstance, LoopTaskRunner, Options, Payload, SyncWorker, Task, Workable, WorkableKind};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// How long a supervised worker gets to drain after SIGTERM.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Parses `key=value` pairs. Entries without `=` are skipped.
pub fn parse_options(raw: &[String]) -> Options {
    let mut options = Options::new();
    for entry in raw {
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                options.insert(key.trim().to_string(), value.to_string());
            }
            _ => warn!(option = %entry, "Ignoring option without key=value form"),
        }
    }
    options
}

/// Consumes a job's queue until `shutdown` resolves.
///
/// Async jobs go through the scheduler; everything else runs on the
/// synchronous loop.
pub async fn start_job<S>(app: &WorkerApp, name: &str, shutdown: S) -> CourierResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let entry = app
        .registry()
        .get(name)
        .ok_or_else(|| CourierError::not_found("Job", name))?;

    match entry.create_job() {
        None => Err(CourierError::InvalidArgument(format!(
            "{} is a {}; use start-task",
            name,
            entry.kind()
        ))),
        Some(JobInstance::Async(job)) if job.is_async() => {
            println!(
                "Starting async job {}: max concurrency {}, timeout {}s, retry {} (max {})",
                name,
                job.max_concurrency(),
                job.timeout().as_secs_f64(),
                if job.should_retry() { "on" } else { "off" },
                job.max_retries()
            );

            let scheduler = app.scheduler();
            scheduler.start_async_processing(name, job.as_ref()).await?;
            shutdown.await;

            if let Some(stats) = scheduler.report_stats(name).await {
                info!(
                    job_name = %name,
                    completed = stats.completed,
                    failed = stats.failed,
                    detached = stats.running,
                    "Final async job stats"
                );
            }
            scheduler.stop_processing(name);
            Ok(())
        }
        Some(_) => {
            let worker = SyncWorker::new(app.workers().clone(), name, &app.config().scheduler);
            let stop = worker.shutdown_handle();
            let stopper = tokio::spawn(async move {
                shutdown.await;
                let _ = stop.send(());
            });

            let result = worker.run().await;
            stopper.abort();
            let summary = result?;
            println!("Processed {} payloads, {} failed", summary.processed, summary.failed);
            Ok(())
        }
    }
}

/// Runs a task until it finishes on its own or `shutdown` resolves.
pub async fn start_task<S>(app: &WorkerApp, name: &str, options: &[String], shutdown: S) -> CourierResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let entry = app
        .registry()
        .resolve_task(name)
        .ok_or_else(|| CourierError::not_found("Task", name))?;
    let options = parse_options(options);

    info!(task = %entry.name(), kind = %entry.kind(), options = ?options, "Starting task");

    match entry.kind() {
        WorkableKind::Task => {
            let mut task = entry
                .create_task()
                .ok_or_else(|| CourierError::internal("task entry without task factory"))?;
            task.set_options(options);

            let stop = task.stop_handle();
            let stopper = tokio::spawn(async move {
                shutdown.await;
                stop.stop();
            });

            let result = tokio::task::spawn_blocking(move || task.run())
                .await
                .map_err(|e| CourierError::internal(format!("task thread failed: {}", e)));
            stopper.abort();
            result??;
            Ok(())
        }
        WorkableKind::LoopTask => {
            let mut task = entry
                .create_loop_task()
                .ok_or_else(|| CourierError::internal("loop task entry without factory"))?;
            task.set_options(options);

            let runner = LoopTaskRunner::new(&app.config().scheduler);
            let stop = runner.shutdown_handle();
            let stopper = tokio::spawn(async move {
                shutdown.await;
                let _ = stop.send(());
            });

            let result = runner.run(task.as_mut()).await;
            stopper.abort();
            let summary = result?;
            println!(
                "Task {} stopped after {} iterations ({}s)",
                entry.name(),
                summary.iterations,
                summary.uptime.as_secs()
            );
            Ok(())
        }
        kind => Err(CourierError::InvalidArgument(format!(
            "{} is a {}; use start-job",
            entry.name(),
            kind
        ))),
    }
}

/// Pushes one JSON object onto a job's queue.
pub async fn push(app: &WorkerApp, name: &str, raw: &str) -> CourierResult<()> {
    let payload: Payload = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(payload)) => payload,
        Ok(_) => return Err(CourierError::InvalidArgument("payload must be a JSON object".to_string())),
        Err(e) => return Err(CourierError::InvalidArgument(format!("invalid JSON payload: {}", e))),
    };

    app.workers().push_job(name, &payload).await?;
    let queue = app.workers().queue_for(name).unwrap_or_default();
    println!("Pushed 1 payload to {} ({} pending)", queue, app.workers().pending(name).await);
    Ok(())
}

/// One line per registered workable, sorted by name.
pub fn list(app: &WorkerApp) -> Vec<String> {
    let mut entries: Vec<_> = app.registry().get_all().values().collect();
    entries.sort_by(|a, b| a.name().cmp(b.name()));

    entries
        .into_iter()
        .map(|entry| {
            let mut line = format!("{:<24} {:<10}", entry.name(), entry.kind().to_string());
            if let Some(queue) = entry.queue() {
                line.push_str(&format!(" queue={}", queue));
            }
            if let Some(config) = entry.async_config().filter(|c| c.is_async) {
                line.push_str(&format!(
                    " max_concurrency={} timeout={}s retries={}",
                    config.max_concurrency,
                    config.timeout.as_secs_f64(),
                    if config.retry_enabled { config.max_retries } else { 0 }
                ));
            }
            line
        })
        .collect()
}

/// Resolves `queue.workers` into `(job, num_workers)` pairs.
///
/// A preset entry may name a job or its queue (without prefix). Every
/// entry must resolve to a registered job.
pub fn plan_workers(app: &WorkerApp) -> CourierResult<Vec<(String, usize)>> {
    let presets = &app.config().queue.workers;
    if presets.is_empty() {
        return Err(CourierError::InvalidArgument(
            "no worker presets configured under queue.workers".to_string(),
        ));
    }

    let registry = app.registry();
    let mut plan = Vec::new();
    for preset in presets {
        for wanted in &preset.queues {
            let entry = registry
                .get(wanted)
                .filter(|entry| entry.kind().is_job())
                .or_else(|| {
                    registry
                        .get_all()
                        .values()
                        .find(|entry| entry.queue() == Some(wanted.as_str()))
                })
                .ok_or_else(|| CourierError::not_found("Job", wanted))?;
            plan.push((entry.name().to_string(), preset.num_workers));
        }
    }
    Ok(plan)
}

/// Starts one `start-job` process per preset worker, keeps them until
/// `shutdown` resolves, then stops them all.
pub async fn supervise<S>(app: &WorkerApp, program: &Path, config_dir: &str, shutdown: S) -> CourierResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let specs = ProcessSpec::start_jobs(&plan_workers(app)?, program, config_dir);
    let supervisor = Supervisor::new(STOP_GRACE);

    for spec in &specs {
        if let Err(e) = supervisor.start(spec) {
            supervisor.stop_all().await;
            return Err(e);
        }
    }

    for (id, status) in supervisor.list() {
        println!("{:<24} {}", id, status);
    }
    info!(processes = specs.len(), "Supervising worker processes");

    shutdown.await;

    for (id, status) in supervisor.list() {
        if !matches!(status, ProcessStatus::Running { .. }) {
            warn!(process_id = %id, status = %status, "Worker process was not running at shutdown");
        }
    }
    let stopped = supervisor.stop_all().await;
    println!("Stopped {} worker processes", stopped.values().filter(|ok| **ok).count());
    Ok(())
}
