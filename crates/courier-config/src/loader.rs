//! Configuration loader with layered sources.

use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use courier_core::CourierError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `COURIER_` prefix
    pub fn new(config_dir: impl Into<String>) -> Result<Self, CourierError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> Result<(), CourierError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &str) -> Result<AppConfig, CourierError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var("COURIER_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!(config_dir = %config_dir, environment = %environment, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("queue.jobs")
                .with_list_parse_key("tasks")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_courier_error)?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_courier_error)?;

        app_config.validate()?;

        info!(
            driver = %app_config.queue.driver,
            jobs = app_config.queue.jobs.len(),
            tasks = app_config.tasks.len(),
            "Configuration loaded"
        );

        Ok(app_config)
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_courier_error(err: ConfigError) -> CourierError {
    CourierError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueDriver;
    use std::fs;

    fn write_default(dir: &Path, contents: &str) {
        fs::write(dir.join("default.toml"), contents).unwrap();
    }

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_default(
            dir.path(),
            r#"
                tasks = ["Heartbeat"]

                [queue]
                driver = "redis"
                prefix = "app_"
                jobs = ["Resize", "Notify"]

                [queue.connections.redis]
                host = "cache"
                database = 3

                [[queue.workers]]
                num_workers = 4
                queues = ["Resize_queue"]

                [scheduler]
                probe_interval_ms = 250
            "#,
        );

        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let config = loader.get().await;

        assert_eq!(config.queue.driver, QueueDriver::Redis);
        assert_eq!(config.queue.prefix, "app_");
        assert_eq!(config.queue.jobs, vec!["Resize", "Notify"]);
        assert_eq!(config.tasks, vec!["Heartbeat"]);
        assert_eq!(config.queue.connections.redis.connection_url(), "redis://cache:6379/3");
        assert_eq!(config.queue.workers[0].num_workers, 4);
        assert_eq!(config.scheduler.probe_interval_ms, 250);
        assert_eq!(config.scheduler.stats_interval_secs, 30);
    }

    #[tokio::test]
    async fn test_broker_alias_and_get_value() {
        let dir = tempfile::tempdir().unwrap();
        write_default(
            dir.path(),
            r#"
                [queue]
                driver = "rabbitmq"

                [queue.connections.rabbitmq]
                host = "broker.internal"
                vhost = "jobs"
            "#,
        );

        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.queue.driver, QueueDriver::Amqp);
        assert_eq!(config.queue.connections.amqp.host, "broker.internal");

        let vhost: Option<String> = loader.get_value("queue.connections.amqp.vhost").await;
        assert_eq!(vhost.as_deref(), Some("jobs"));
        let missing: Option<String> = loader.get_value("queue.nope").await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_unsupported_driver_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        write_default(dir.path(), "[queue]\ndriver = \"kafka\"\n");

        match ConfigLoader::new(dir.path().to_string_lossy()) {
            Err(CourierError::Configuration(msg)) => assert!(msg.contains("kafka") || msg.contains("variant")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("kafka driver should be rejected"),
        }
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_default(dir.path(), "[queue]\ndriver = \"memory\"\njobs = [\"Resize\"]\n");
        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        assert_eq!(loader.get().await.queue.jobs.len(), 1);

        write_default(dir.path(), "[queue]\ndriver = \"memory\"\njobs = [\"Resize\", \"Notify\"]\n");
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.queue.jobs.len(), 2);
    }

    #[test]
    fn test_default_toml_round_trip() {
        let rendered = toml::to_string(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.queue.driver, QueueDriver::Amqp);
        assert_eq!(parsed.scheduler.sync_poll_interval_ms, 1_000);
    }
}
