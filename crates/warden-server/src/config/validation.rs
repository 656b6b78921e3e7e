//! Configuration validation.

use super::types::WorkerConfig;
use thiserror::Error;
use warden_common_async::RuntimeFlavor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Invalid worker count: {0}")]
    InvalidWorkerCount(usize),

    #[error("Shutdown ceiling must be non-zero")]
    ZeroCeiling,

    #[error("Shutdown stage budget ({stage}) of {stage_secs}s exceeds the {ceiling_secs}s ceiling")]
    StageExceedsCeiling {
        stage: &'static str,
        stage_secs: u64,
        ceiling_secs: u64,
    },

    #[error("worker_threads is only meaningful for the multi_thread runtime")]
    WorkerThreadsWithoutMultiThread,

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Validate worker configuration, collecting every problem found.
pub fn validate_config(config: &WorkerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.server.socket_addr().is_err() {
        errors.push(ConfigError::InvalidBindAddress(format!(
            "{}:{}",
            config.server.host, config.server.port
        )));
    }

    if config.workers.count == Some(0) {
        errors.push(ConfigError::InvalidWorkerCount(0));
    }

    let shutdown = &config.shutdown;
    if shutdown.ceiling_secs == 0 {
        errors.push(ConfigError::ZeroCeiling);
    } else {
        for (stage, stage_secs) in [
            ("app cleanup", shutdown.app_cleanup_timeout_secs),
            ("task cancellation", shutdown.task_cancel_timeout_secs),
        ] {
            if stage_secs > shutdown.ceiling_secs {
                errors.push(ConfigError::StageExceedsCeiling {
                    stage,
                    stage_secs,
                    ceiling_secs: shutdown.ceiling_secs,
                });
            }
        }
    }

    if config.runtime.flavor == RuntimeFlavor::CurrentThread && config.runtime.worker_threads > 0 {
        errors.push(ConfigError::WorkerThreadsWithoutMultiThread);
    }

    if warden_common_log::LogLevel::parse(&config.logging.level).is_none() {
        errors.push(ConfigError::InvalidLogLevel(config.logging.level.clone()));
    }

    if warden_common_log::LogFormat::parse(&config.logging.format).is_none() {
        errors.push(ConfigError::InvalidLogFormat(config.logging.format.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
