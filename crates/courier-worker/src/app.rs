//! Composition root: configuration, backend, registry and managers.

use courier_config::{AppConfig, ConfigLoader};
use courier_core::{init_logging, CourierResult};
use courier_jobs::{
    register_metrics, select_backend, AsyncJobManager, Catalog, QueueBackend, WorkableRegistry, WorkerManager,
};
use std::sync::Arc;
use tracing::info;

/// The wired-up worker process.
pub struct WorkerApp {
    config: AppConfig,
    workers: WorkerManager,
    scheduler: AsyncJobManager,
}

impl WorkerApp {
    /// Loads configuration from `config_dir`, initialises logging and wires
    /// everything against the catalog.
    pub async fn bootstrap(config_dir: &str, catalog: &Catalog) -> CourierResult<Self> {
        let loader = ConfigLoader::new(config_dir)?;
        let config = loader.get().await;
        init_logging(&config.observability)?;

        info!("Starting {} worker...", config.app.name);
        info!("Version: {}", env!("CARGO_PKG_VERSION"));
        info!("Environment: {}", config.app.environment);

        Self::build(config, catalog).await
    }

    /// Wires the app from an already loaded configuration.
    pub async fn build(config: AppConfig, catalog: &Catalog) -> CourierResult<Self> {
        let backend = select_backend(&config.queue).await?;
        Self::with_backend(config, catalog, backend)
    }

    /// Wires the app over a given backend.
    ///
    /// The configuration is validated here as well as in the loader, since
    /// callers may build it in code.
    pub fn with_backend(config: AppConfig, catalog: &Catalog, backend: Arc<dyn QueueBackend>) -> CourierResult<Self> {
        config.validate()?;
        let names = config.queue.jobs.iter().chain(&config.tasks).map(String::as_str);
        let registry = WorkableRegistry::from_names(names, catalog)?;
        register_metrics();

        info!(
            driver = %backend.driver(),
            jobs = config.queue.jobs.len(),
            tasks = config.tasks.len(),
            "Worker app initialized"
        );

        let workers = WorkerManager::new(backend, Arc::new(registry));
        let scheduler = AsyncJobManager::new(workers.clone(), &config.scheduler);
        Ok(Self {
            config,
            workers,
            scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerManager {
        &self.workers
    }

    pub fn registry(&self) -> &WorkableRegistry {
        self.workers.registry()
    }

    pub fn scheduler(&self) -> &AsyncJobManager {
        &self.scheduler
    }
}
