//! # Courier Worker
//!
//! Worker process for Courier: wires configuration, the queue backend and
//! the workable registry, then runs jobs and tasks named on the command line.

pub mod app;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod supervisor;

pub use app::WorkerApp;
pub use catalog::builtin_catalog;
pub use cli::{Cli, Commands};
