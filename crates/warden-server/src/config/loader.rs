//! Configuration loading utilities.

use super::types::WorkerConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming an optional config file.
pub const CONFIG_PATH_VAR: &str = "WARDEN_CONFIG";

/// Platform-provided port, honoured over file and prefixed settings.
pub const PORT_VAR: &str = "PORT";

/// Load configuration from embedded defaults, an optional file, and the
/// environment, in that order of precedence.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
    port_override: Option<u16>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: "WARDEN".to_string(),
            port_override: None,
        }
    }

    /// Set config file path.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Force the listening port, above every other source.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    /// Load configuration.
    pub fn load(&self) -> Result<WorkerConfig> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::File::from_str(
            include_str!("defaults.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = &self.config_path {
            if Path::new(path).exists() {
                info!(path = %path.display(), "Loading config file");
                builder = builder.add_source(config::File::from(path.as_path()));
            } else {
                info!(path = %path.display(), "Config file not found, using defaults");
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(port) = std::env::var(PORT_VAR) {
            builder = builder
                .set_override("server.port", port)
                .context("Failed to apply PORT override")?;
        }

        if let Some(port) = self.port_override {
            builder = builder
                .set_override("server.port", i64::from(port))
                .context("Failed to apply port override")?;
        }

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration, taking the file path from `WARDEN_CONFIG` when set.
pub fn load_config() -> Result<WorkerConfig> {
    let mut loader = ConfigLoader::new();
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        loader = loader.with_config_path(path);
    }
    loader.load()
}
