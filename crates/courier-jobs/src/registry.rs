//! Name-based workable registry.
//!
//! Maps a short name to a factory producing fresh instances. The registry is
//! built once by the composition root, from the configured job and task
//! names resolved against a [`Catalog`] of compiled-in types, and is shared
//! read-only afterwards.

use crate::error::{JobError, JobResult};
use crate::job::{AsyncJob, AsyncJobConfig, Job, JobInstance};
use crate::loop_task::LoopTask;
use crate::workable::Task;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;
type LoopTaskFactory = Arc<dyn Fn() -> Box<dyn LoopTask> + Send + Sync>;
type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;
type AsyncJobFactory = Arc<dyn Fn() -> Box<dyn AsyncJob> + Send + Sync>;

/// Constructor of one workable type.
#[derive(Clone)]
enum Factory {
    Task(TaskFactory),
    LoopTask(LoopTaskFactory),
    Job(JobFactory),
    AsyncJob(AsyncJobFactory),
}

/// Kind of workable behind a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkableKind {
    Task,
    LoopTask,
    Job,
    AsyncJob,
}

impl WorkableKind {
    /// Returns true if entries of this kind consume a queue.
    pub fn is_job(&self) -> bool {
        matches!(self, Self::Job | Self::AsyncJob)
    }
}

impl fmt::Display for WorkableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::LoopTask => write!(f, "loop-task"),
            Self::Job => write!(f, "job"),
            Self::AsyncJob => write!(f, "async-job"),
        }
    }
}

/// A registered workable type.
///
/// Name, queue and async config are read from one probe instance when the
/// entry is built; they are fixed per type.
#[derive(Clone)]
pub struct WorkableEntry {
    name: String,
    factory: Factory,
    queue: Option<String>,
    async_config: Option<AsyncJobConfig>,
}

impl WorkableEntry {
    /// Entry for a repeatable task.
    pub fn task<T, F>(factory: F) -> Self
    where
        T: Task + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = factory().name().to_string();
        Self {
            name,
            factory: Factory::Task(Arc::new(move || -> Box<dyn Task> { Box::new(factory()) })),
            queue: None,
            async_config: None,
        }
    }

    /// Entry for a tick-driven loop task.
    pub fn loop_task<T, F>(factory: F) -> Self
    where
        T: LoopTask + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = factory().name().to_string();
        Self {
            name,
            factory: Factory::LoopTask(Arc::new(move || -> Box<dyn LoopTask> { Box::new(factory()) })),
            queue: None,
            async_config: None,
        }
    }

    /// Entry for a synchronous queue job.
    pub fn job<T, F>(factory: F) -> Self
    where
        T: Job,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let probe = factory();
        Self {
            name: probe.name().to_string(),
            queue: Some(probe.queue()),
            factory: Factory::Job(Arc::new(move || -> Box<dyn Job> { Box::new(factory()) })),
            async_config: None,
        }
    }

    /// Entry for an async queue job.
    pub fn async_job<T, F>(factory: F) -> Self
    where
        T: AsyncJob,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let probe = factory();
        Self {
            name: probe.name().to_string(),
            queue: Some(probe.queue()),
            async_config: Some(probe.config()),
            factory: Factory::AsyncJob(Arc::new(move || -> Box<dyn AsyncJob> { Box::new(factory()) })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> WorkableKind {
        match self.factory {
            Factory::Task(_) => WorkableKind::Task,
            Factory::LoopTask(_) => WorkableKind::LoopTask,
            Factory::Job(_) => WorkableKind::Job,
            Factory::AsyncJob(_) => WorkableKind::AsyncJob,
        }
    }

    /// Backing queue name, before the backend prefix. `None` for tasks.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Scheduling metadata for async jobs.
    pub fn async_config(&self) -> Option<&AsyncJobConfig> {
        self.async_config.as_ref()
    }

    pub fn create_task(&self) -> Option<Box<dyn Task>> {
        match &self.factory {
            Factory::Task(factory) => Some(factory()),
            _ => None,
        }
    }

    pub fn create_loop_task(&self) -> Option<Box<dyn LoopTask>> {
        match &self.factory {
            Factory::LoopTask(factory) => Some(factory()),
            _ => None,
        }
    }

    /// Builds a fresh job instance, sync or async.
    pub fn create_job(&self) -> Option<JobInstance> {
        match &self.factory {
            Factory::Job(factory) => Some(JobInstance::Sync(factory())),
            Factory::AsyncJob(factory) => Some(JobInstance::Async(factory())),
            _ => None,
        }
    }

    pub fn create_async_job(&self) -> Option<Box<dyn AsyncJob>> {
        match &self.factory {
            Factory::AsyncJob(factory) => Some(factory()),
            _ => None,
        }
    }

    fn validate(&self) -> JobResult<()> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(JobError::InvalidWorkable(format!(
                "workable name {:?} must be non-empty and contain no whitespace",
                self.name
            )));
        }
        if let Some(queue) = &self.queue {
            if queue.trim().is_empty() {
                return Err(JobError::InvalidWorkable(format!("{} derives an empty queue name", self.name)));
            }
        }
        if let Some(config) = &self.async_config {
            config.validate().map_err(|e| match e {
                JobError::InvalidWorkable(msg) => JobError::InvalidWorkable(format!("{}: {}", self.name, msg)),
                other => other,
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for WorkableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkableEntry")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("queue", &self.queue)
            .field("async_config", &self.async_config)
            .finish()
    }
}

/// Every workable type compiled into the application.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, WorkableEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, keyed by its name.
    #[must_use]
    pub fn with(mut self, entry: WorkableEntry) -> Self {
        self.entries.insert(entry.name.clone(), entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<&WorkableEntry> {
        self.entries.get(name)
    }

    /// Names in the catalog, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Name to factory lookup for workables.
#[derive(Debug, Clone, Default)]
pub struct WorkableRegistry {
    entries: HashMap<String, WorkableEntry>,
}

impl WorkableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configured names.
    ///
    /// Every name must exist in the catalog; a miss is a startup error.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>, catalog: &Catalog) -> JobResult<Self> {
        let mut registry = Self::new();
        for name in names {
            let entry = catalog.get(name).ok_or_else(|| {
                JobError::InvalidWorkable(format!(
                    "{} is not a known job or task type (known: {})",
                    name,
                    catalog.names().join(", ")
                ))
            })?;
            registry.register(entry.clone())?;
        }
        Ok(registry)
    }

    /// Registers an entry under its name. The last registration wins.
    pub fn register(&mut self, entry: WorkableEntry) -> JobResult<()> {
        entry.validate()?;

        debug!(name = %entry.name, kind = %entry.kind(), queue = ?entry.queue, "Registered workable");
        if let Some(previous) = self.entries.insert(entry.name.clone(), entry) {
            warn!(name = %previous.name, "Workable registered twice, keeping the last registration");
        }
        Ok(())
    }

    /// Looks up a name. A miss returns `None`.
    pub fn get(&self, name: &str) -> Option<&WorkableEntry> {
        self.entries.get(name)
    }

    pub fn get_all(&self) -> &HashMap<String, WorkableEntry> {
        &self.entries
    }

    /// Looks up a task by a loosely typed name.
    ///
    /// Tries the StudlyCase form first, then the same with a `Task` suffix,
    /// so `heartbeat`, `Heartbeat` and `HeartbeatTask` all resolve.
    pub fn resolve_task(&self, name: &str) -> Option<&WorkableEntry> {
        let studly = studly_case(name);
        if let Some(entry) = self.get(&studly) {
            return Some(entry);
        }
        if studly.ends_with("Task") {
            return None;
        }
        self.get(&format!("{}Task", studly))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Converts `send-report`, `send_report` or `send report` to `SendReport`.
pub fn studly_case(name: &str) -> String {
    name.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
