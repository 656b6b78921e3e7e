//! Async runtime utilities.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Scheduler flavor for a worker runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeFlavor {
    /// Single-threaded cooperative scheduler.
    #[default]
    CurrentThread,
    /// Work-stealing scheduler across `worker_threads` threads.
    MultiThread,
}

/// Configuration for a worker runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Scheduler flavor.
    pub flavor: RuntimeFlavor,
    /// Number of worker threads for the multi-thread flavor (0 = num_cpus).
    pub worker_threads: usize,
    /// Thread name prefix.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flavor: RuntimeFlavor::default(),
            worker_threads: 0, // Use num_cpus
            thread_name: "warden-worker".to_string(),
        }
    }
}

/// Build a configured Tokio runtime with I/O and time drivers enabled.
pub fn build_runtime(config: &RuntimeConfig) -> std::io::Result<Runtime> {
    let mut builder = match config.flavor {
        RuntimeFlavor::CurrentThread => Builder::new_current_thread(),
        RuntimeFlavor::MultiThread => {
            let mut builder = Builder::new_multi_thread();
            if config.worker_threads > 0 {
                builder.worker_threads(config.worker_threads);
            }
            builder
        }
    };

    builder.thread_name(&config.thread_name).enable_all().build()
}

/// Run a future with a timeout.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { after: duration })
}

/// Timeout error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation timed out after {after:?}")]
pub struct TimeoutError {
    /// The budget that was exceeded.
    pub after: Duration,
}

/// Run multiple futures concurrently, returning when all complete.
pub async fn join_all<I, F, T>(futures: I) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    futures::future::join_all(futures).await
}
