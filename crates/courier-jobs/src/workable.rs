//! The base unit-of-work capability shared by tasks and jobs.
//!
//! A [`Workable`] has a stable short name, free-form string options and a
//! running flag. A [`Task`] adds the repeatable `execute`/`run` loop used by
//! long-lived workers; jobs are defined in [`crate::job`].

use crate::error::JobResult;
use crate::job::JobId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Free-form key/value options passed on the command line.
pub type Options = HashMap<String, String>;

/// Returns the last path segment of a type's name, without generics.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// State every workable carries: identity, running flag and options.
#[derive(Debug, Clone)]
pub struct WorkableState {
    id: JobId,
    running: Arc<AtomicBool>,
    options: Options,
}

impl Default for WorkableState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkableState {
    /// Creates a running state with a fresh identifier.
    ///
    /// The flag is armed here, not in `run`, so a stop issued before the
    /// loop starts is never lost. Once cleared it stays cleared.
    pub fn new() -> Self {
        Self {
            id: JobId::new(),
            running: Arc::new(AtomicBool::new(true)),
            options: Options::new(),
        }
    }

    /// Identifier generated when the instance was built.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clears the running flag. Returns true if it was set.
    pub(crate) fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }
}

/// Clears a workable's running flag from another thread or task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Asks the workable to stop after its current `execute`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Base capability of every named unit of work.
pub trait Workable: Send {
    /// Stable short identifier; defaults to the type's own name.
    fn name(&self) -> &'static str {
        short_type_name::<Self>()
    }

    fn state(&self) -> &WorkableState;

    fn state_mut(&mut self) -> &mut WorkableState;

    /// Merges options into the current set; later keys win.
    fn set_options(&mut self, options: Options) {
        self.state_mut().options.extend(options);
    }

    fn option(&self, key: &str) -> Option<&str> {
        self.state().options.get(key).map(String::as_str)
    }

    fn options(&self) -> &Options {
        &self.state().options
    }

    /// Stops the workable. Safe to call repeatedly and from failure paths.
    fn destroy(&mut self) {
        if self.state().stop() {
            info!(workable = self.name(), "Workable stopped");
        }
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.state().running),
        }
    }
}

/// Long-lived repeatable work.
pub trait Task: Workable {
    /// One iteration of work. `run` calls it until the task is destroyed.
    fn execute(&mut self) -> JobResult<()>;

    /// Loops over `execute` while running.
    ///
    /// A failing iteration destroys the task and returns the error. A task
    /// destroyed before `run` returns without executing.
    fn run(&mut self) -> JobResult<()> {
        info!(task = self.name(), id = %self.state().id(), "Task started");

        while self.state().is_running() {
            if let Err(e) = self.execute() {
                error!(task = self.name(), error = %e, "Task iteration failed");
                self.destroy();
                return Err(e);
            }
        }

        info!(task = self.name(), "Task finished");
        Ok(())
    }
}
