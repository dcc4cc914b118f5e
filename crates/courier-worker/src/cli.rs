//! CLI argument definitions using clap.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "courier-worker")]
#[command(author = "Courier Team")]
#[command(version)]
#[command(about = "Run Courier jobs and tasks", long_about = None)]
pub struct Cli {
    /// Directory holding default.toml and the per-environment overrides
    #[arg(long, env = "COURIER_CONFIG_DIR", default_value = "./config")]
    pub config_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume a job's queue until interrupted
    StartJob {
        /// Registered job name
        name: String,
    },

    /// Run a task until it finishes or is interrupted
    StartTask {
        /// Task name; `heartbeat` also resolves `HeartbeatTask`
        name: String,

        /// Task option as key=value, repeatable
        #[arg(short, long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },

    /// Push a JSON object onto a job's queue
    Push {
        /// Registered job name
        name: String,

        /// Payload, a JSON object
        payload: String,
    },

    /// List registered jobs and tasks
    List,

    /// Run the `queue.workers` presets as child worker processes
    Supervise,
}
