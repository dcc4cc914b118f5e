//! # Courier Config
//!
//! Configuration management for Courier.
//! Supports layered configuration from files, environment variables,
//! and runtime refresh.

mod app_config;
mod loader;
mod queue;

pub use app_config::*;
pub use loader::*;
pub use queue::*;
