//! Worker process supervision.
//!
//! Runs `start-job` worker processes for the `queue.workers` presets and
//! keeps a table of the live ones for start, stop and status.

use courier_core::{CourierError, CourierResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How to launch one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// One `start-job` process per requested worker, ids `<job>#<n>`.
    ///
    /// A job listed by several presets keeps counting, so ids stay unique.
    pub fn start_jobs(jobs: &[(String, usize)], program: &Path, config_dir: &str) -> Vec<Self> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut specs = Vec::new();
        for (job, count) in jobs {
            let next = seen.entry(job.as_str()).or_insert(0);
            for _ in 0..*count {
                *next += 1;
                specs.push(Self {
                    id: format!("{}#{}", job, next),
                    program: program.to_path_buf(),
                    args: vec![
                        "--config-dir".to_string(),
                        config_dir.to_string(),
                        "start-job".to_string(),
                        job.clone(),
                    ],
                });
            }
        }
        specs
    }
}

/// What the supervisor knows about a process id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running { pid: u32, uptime: Duration },
    /// The process ended on its own; reported once, then forgotten.
    Exited { code: Option<i32> },
    NotFound,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { pid, uptime } => write!(f, "running pid={} uptime={}s", pid, uptime.as_secs()),
            Self::Exited { code: Some(code) } => write!(f, "exited code={}", code),
            Self::Exited { code: None } => write!(f, "exited by signal"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

struct Managed {
    child: Child,
    pid: u32,
    started: Instant,
}

/// Table of worker processes started by this process.
pub struct Supervisor {
    grace: Duration,
    children: Mutex<BTreeMap<String, Managed>>,
}

impl Supervisor {
    /// `grace` is how long `stop` waits after SIGTERM before killing.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts a process. Returns false if one with the same id is still running.
    pub fn start(&self, spec: &ProcessSpec) -> CourierResult<bool> {
        let mut children = self.children.lock();
        if let Some(existing) = children.get_mut(&spec.id) {
            if matches!(existing.child.try_wait(), Ok(None)) {
                warn!(process_id = %spec.id, pid = existing.pid, "Worker process already running");
                return Ok(false);
            }
        }

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CourierError::internal(format!("failed to start {}: {}", spec.id, e)))?;
        let pid = child.id().unwrap_or_default();

        info!(process_id = %spec.id, pid, program = %spec.program.display(), "Started worker process");
        children.insert(
            spec.id.clone(),
            Managed {
                child,
                pid,
                started: Instant::now(),
            },
        );
        Ok(true)
    }

    pub fn status(&self, id: &str) -> ProcessStatus {
        let mut children = self.children.lock();
        let Some(managed) = children.get_mut(id) else {
            return ProcessStatus::NotFound;
        };

        match managed.child.try_wait() {
            Ok(None) => ProcessStatus::Running {
                pid: managed.pid,
                uptime: managed.started.elapsed(),
            },
            Ok(Some(status)) => {
                children.remove(id);
                ProcessStatus::Exited { code: status.code() }
            }
            Err(e) => {
                warn!(process_id = %id, error = %e, "Failed to poll worker process");
                children.remove(id);
                ProcessStatus::Exited { code: None }
            }
        }
    }

    /// Status of every tracked process, by id.
    pub fn list(&self) -> BTreeMap<String, ProcessStatus> {
        let ids: Vec<String> = self.children.lock().keys().cloned().collect();
        ids.into_iter()
            .map(|id| {
                let status = self.status(&id);
                (id, status)
            })
            .collect()
    }

    /// Stops a process: SIGTERM first, then a kill after the grace period.
    ///
    /// Returns false if the id is unknown.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(managed) = self.children.lock().remove(id) else {
            warn!(process_id = %id, "Worker process not found");
            return false;
        };
        self.terminate(id, managed).await;
        true
    }

    pub async fn stop_all(&self) -> BTreeMap<String, bool> {
        let ids: Vec<String> = self.children.lock().keys().cloned().collect();
        let mut results = BTreeMap::new();
        for id in ids {
            let stopped = self.stop(&id).await;
            results.insert(id, stopped);
        }
        results
    }

    async fn terminate(&self, id: &str, mut managed: Managed) {
        if let Ok(Some(status)) = managed.child.try_wait() {
            info!(process_id = %id, code = ?status.code(), "Worker process had already exited");
            return;
        }

        request_shutdown(id, managed.pid).await;
        match tokio::time::timeout(self.grace, managed.child.wait()).await {
            Ok(Ok(status)) => info!(process_id = %id, code = ?status.code(), "Stopped worker process"),
            Ok(Err(e)) => error!(process_id = %id, error = %e, "Failed to wait for worker process"),
            Err(_) => {
                warn!(
                    process_id = %id,
                    grace_secs = self.grace.as_secs_f64(),
                    "Worker process ignored SIGTERM, killing"
                );
                if let Err(e) = managed.child.kill().await {
                    error!(process_id = %id, error = %e, "Failed to kill worker process");
                }
            }
        }
    }
}

/// Sends SIGTERM so the worker drains before exiting. tokio's `Child` can
/// only send SIGKILL.
#[cfg(unix)]
async fn request_shutdown(id: &str, pid: u32) {
    match Command::new("kill").arg("-TERM").arg(pid.to_string()).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(process_id = %id, pid, code = ?status.code(), "kill -TERM failed"),
        Err(e) => warn!(process_id = %id, pid, error = %e, "Failed to run kill"),
    }
}

#[cfg(not(unix))]
async fn request_shutdown(_id: &str, _pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_job_specs() {
        let jobs = vec![("EchoJob".to_string(), 2), ("LogJob".to_string(), 1), ("EchoJob".to_string(), 1)];
        let specs = ProcessSpec::start_jobs(&jobs, Path::new("/usr/bin/courier-worker"), "/etc/courier");

        let ids: Vec<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["EchoJob#1", "EchoJob#2", "LogJob#1", "EchoJob#3"]);
        assert_eq!(specs[2].args, vec!["--config-dir", "/etc/courier", "start-job", "LogJob"]);
        assert_eq!(specs[0].program, PathBuf::from("/usr/bin/courier-worker"));
    }

    #[test]
    fn test_status_display() {
        let running = ProcessStatus::Running {
            pid: 42,
            uptime: Duration::from_secs(90),
        };
        assert_eq!(running.to_string(), "running pid=42 uptime=90s");
        assert_eq!(ProcessStatus::Exited { code: Some(1) }.to_string(), "exited code=1");
        assert_eq!(ProcessStatus::NotFound.to_string(), "not found");
    }

    #[cfg(unix)]
    fn spec(id: &str, program: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            id: id.to_string(),
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_status_stop() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let sleeper = spec("sleeper#1", "sleep", &["30"]);

        assert!(supervisor.start(&sleeper).unwrap());
        assert!(!supervisor.start(&sleeper).unwrap());
        assert!(matches!(supervisor.status("sleeper#1"), ProcessStatus::Running { .. }));
        assert_eq!(supervisor.list().len(), 1);

        assert!(supervisor.stop("sleeper#1").await);
        assert_eq!(supervisor.status("sleeper#1"), ProcessStatus::NotFound);
        assert!(!supervisor.stop("sleeper#1").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_is_reported_once() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        assert!(supervisor.start(&spec("oneshot#1", "sh", &["-c", "exit 3"])).unwrap());

        let mut status = supervisor.status("oneshot#1");
        for _ in 0..500 {
            if !matches!(status, ProcessStatus::Running { .. }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = supervisor.status("oneshot#1");
        }
        assert_eq!(status, ProcessStatus::Exited { code: Some(3) });
        assert_eq!(supervisor.status("oneshot#1"), ProcessStatus::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_after_grace() {
        let supervisor = Supervisor::new(Duration::from_millis(200));
        let stubborn = spec("stubborn#1", "sh", &["-c", "trap '' TERM; sleep 30"]);
        assert!(supervisor.start(&stubborn).unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let results = supervisor.stop_all().await;
        assert_eq!(results.get("stubborn#1"), Some(&true));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(supervisor.list().is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let missing = ProcessSpec {
            id: "ghost#1".to_string(),
            program: PathBuf::from("/nonexistent/courier-worker"),
            args: Vec::new(),
        };
        assert!(supervisor.start(&missing).is_err());
        assert_eq!(supervisor.status("ghost#1"), ProcessStatus::NotFound);
    }
}
