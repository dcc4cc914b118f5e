//! # Courier Worker
//!
//! Usage:
//!   courier-worker start-job EchoJob
//!   courier-worker start-task heartbeat -o interval_ms=500
//!   courier-worker push EchoJob '{"message": "hi"}'
//!   courier-worker list
//!   courier-worker supervise

use clap::Parser;
use courier_core::{CourierError, CourierResult};
use courier_worker::{builtin_catalog, commands, Cli, Commands, WorkerApp};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("Application error: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> CourierResult<()> {
    let app = WorkerApp::bootstrap(&cli.config_dir, &builtin_catalog()).await?;

    match cli.command {
        Commands::StartJob { name } => commands::start_job(&app, &name, shutdown_signal()).await?,
        Commands::StartTask { name, options } => {
            commands::start_task(&app, &name, &options, shutdown_signal()).await?;
        }
        Commands::Push { name, payload } => commands::push(&app, &name, &payload).await?,
        Commands::List => {
            for line in commands::list(&app) {
                println!("{}", line);
            }
        }
        Commands::Supervise => {
            let program = std::env::current_exe()
                .map_err(|e| CourierError::internal(format!("cannot locate worker binary: {}", e)))?;
            commands::supervise(&app, &program, &cli.config_dir, shutdown_signal()).await?;
        }
    }

    info!("Worker finished");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
