//! Configuration loader with layered sources.

use crate::{AppConfig, DeploymentRole};
use config::{Config, ConfigError, Environment, File};
use conveyor_core::{ConveyorError, ConveyorResult};
use conveyor_jobs::BrokerBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Environment variable prefix. `CONVEYOR_JOBS__BROKER__BACKEND=memory`
/// overrides `jobs.broker.backend`.
pub const ENV_PREFIX: &str = "CONVEYOR";

/// Selects the `{environment}.toml` layer.
pub const ENVIRONMENT_VAR: &str = "CONVEYOR_ENVIRONMENT";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
    environment: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `{config_dir}/default.toml`
    /// 2. `{config_dir}/{environment}.toml`
    /// 3. `{config_dir}/local.toml`
    /// 4. Environment variables with `CONVEYOR_` prefix and `__` nesting
    ///
    /// The environment name comes from `CONVEYOR_ENVIRONMENT` and defaults
    /// to `development`.
    pub fn new(config_dir: impl Into<PathBuf>) -> ConveyorResult<Self> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        Self::with_environment(config_dir, environment)
    }

    /// Creates a loader for an explicit environment name.
    pub fn with_environment(
        config_dir: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> ConveyorResult<Self> {
        let config_dir = config_dir.into();
        let environment = environment.into();
        let config = Self::load_config(&config_dir, &environment)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
            environment,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> ConveyorResult<Self> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Name of the active environment layer.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Reloads the configuration from disk. On error the previous
    /// configuration stays in place.
    pub async fn reload(&self) -> ConveyorResult<()> {
        let new_config = Self::load_config(&self.config_dir, &self.environment)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &Path, environment: &str) -> ConveyorResult<AppConfig> {
        info!(environment, config_dir = %config_dir.display(), "Loading configuration");

        let mut builder = Config::builder()
            .set_override("app.environment", environment)
            .map_err(config_error_to_conveyor_error)?;

        for layer in ["default", environment, "local"] {
            let path = config_dir.join(format!("{}.toml", layer));
            if path.exists() {
                debug!("Loading config layer from: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(config_error_to_conveyor_error)?;

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    /// Validates the configuration.
    fn validate_config(config: &AppConfig) -> ConveyorResult<()> {
        config
            .jobs
            .validate()
            .map_err(|e| ConveyorError::Configuration(e.to_string()))?;

        if config.jobs.broker.backend == BrokerBackend::Memory
            && config.deployment.role != DeploymentRole::All
        {
            return Err(ConveyorError::Configuration(format!(
                "jobs.broker.backend = \"memory\" requires deployment.role = \"all\", got \"{}\"",
                config.deployment.role
            )));
        }

        if config.server.port == 0 && config.deployment.role.has_api() {
            return Err(ConveyorError::Configuration(
                "server.port must be set when the API is enabled".to_string(),
            ));
        }

        if config.app.environment == "production"
            && config.server.cors_origins.iter().any(|o| o == "*")
        {
            warn!("CORS allows any origin in production");
        }

        Ok(())
    }

    /// Gets a specific configuration value by dotted key path, e.g.
    /// `jobs.worker.concurrency`.
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

fn config_error_to_conveyor_error(err: ConfigError) -> ConveyorError {
    ConveyorError::Configuration(err.to_string())
}
