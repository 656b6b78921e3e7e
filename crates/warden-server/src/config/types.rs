//! Worker configuration types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use warden_common_async::RuntimeConfig;

/// Main worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerBindConfig,
    /// Worker pool sizing and recycling.
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Graceful shutdown budgets.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Runtime flavor for the worker process.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBindConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keep-alive idle time for accepted connections.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Hard per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_keepalive() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    230
}

impl Default for ServerBindConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keepalive_secs: default_keepalive(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerBindConfig {
    /// Resolve the bind address. Fails for hosts that are not IP literals.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Worker pool sizing and request-count recycling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Explicit worker count; derived from the CPU count when unset.
    #[serde(default)]
    pub count: Option<usize>,
    /// Hosts that advertise several CPUs but can only sustain one worker.
    #[serde(default)]
    pub reduced_capacity: bool,
    /// Requests a worker serves before recycling itself (0 disables).
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Upper bound of the random jitter added to `max_requests`.
    #[serde(default = "default_max_requests_jitter")]
    pub max_requests_jitter: u64,
}

fn default_max_requests() -> u64 {
    1000
}

fn default_max_requests_jitter() -> u64 {
    50
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: None,
            reduced_capacity: false,
            max_requests: default_max_requests(),
            max_requests_jitter: default_max_requests_jitter(),
        }
    }
}

impl WorkersConfig {
    /// Number of worker processes a pool manager should run.
    pub fn worker_count(&self) -> usize {
        self.worker_count_for(num_cpus::get())
    }

    /// Worker count for a given CPU count: `2 * cpus + 1` unless overridden.
    pub fn worker_count_for(&self, cpus: usize) -> usize {
        if self.reduced_capacity {
            return 1;
        }
        self.count.unwrap_or(cpus * 2 + 1)
    }
}

/// Graceful shutdown budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Outer ceiling from the first trigger to process exit.
    #[serde(default = "default_ceiling")]
    pub ceiling_secs: u64,
    /// Budget for the application's cleanup hook.
    #[serde(default = "default_app_cleanup_timeout")]
    pub app_cleanup_timeout_secs: u64,
    /// Per-task budget for acknowledging cancellation.
    #[serde(default = "default_task_cancel_timeout")]
    pub task_cancel_timeout_secs: u64,
    /// Pause after cleanup so transport buffers can flush.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Wait on cancelled tasks concurrently instead of one at a time.
    #[serde(default)]
    pub concurrent_task_waits: bool,
    /// Drain even when the serve-loop exits without a trigger.
    #[serde(default = "default_true")]
    pub drain_on_unsignalled_exit: bool,
}

fn default_ceiling() -> u64 {
    20
}

fn default_app_cleanup_timeout() -> u64 {
    10
}

fn default_task_cancel_timeout() -> u64 {
    5
}

fn default_settle_delay() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            ceiling_secs: default_ceiling(),
            app_cleanup_timeout_secs: default_app_cleanup_timeout(),
            task_cancel_timeout_secs: default_task_cancel_timeout(),
            settle_delay_ms: default_settle_delay(),
            concurrent_task_waits: false,
            drain_on_unsignalled_exit: true,
        }
    }
}

impl ShutdownConfig {
    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }

    pub fn app_cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.app_cleanup_timeout_secs)
    }

    pub fn task_cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.task_cancel_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty, compact or json).
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Emit per-request access lines to stdout.
    #[serde(default = "default_true")]
    pub access_log: bool,
    /// Include file and line of each diagnostic event.
    #[serde(default)]
    pub source_location: bool,
    /// Log span open and close events.
    #[serde(default)]
    pub span_events: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            access_log: true,
            source_location: false,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    /// Convert into the logging crate's configuration. Unknown values fall
    /// back to defaults; `validate_config` reports them.
    pub fn to_log_config(&self) -> warden_common_log::LogConfig {
        warden_common_log::LogConfig {
            level: warden_common_log::LogLevel::parse(&self.level).unwrap_or_default(),
            format: warden_common_log::LogFormat::parse(&self.format).unwrap_or_default(),
            access_log: self.access_log,
            source_location: self.source_location,
            span_events: self.span_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_derived_from_cpus() {
        let workers = WorkersConfig::default();
        assert_eq!(workers.worker_count_for(4), 9);
        assert_eq!(workers.worker_count_for(1), 3);
    }

    #[test]
    fn test_reduced_capacity_forces_single_worker() {
        let workers = WorkersConfig {
            reduced_capacity: true,
            count: Some(8),
            ..Default::default()
        };
        assert_eq!(workers.worker_count_for(2), 1);
    }

    #[test]
    fn test_explicit_worker_count() {
        let workers = WorkersConfig {
            count: Some(3),
            ..Default::default()
        };
        assert_eq!(workers.worker_count_for(16), 3);
    }

    #[test]
    fn test_shutdown_durations() {
        let shutdown = ShutdownConfig::default();
        assert_eq!(shutdown.ceiling(), Duration::from_secs(20));
        assert_eq!(shutdown.app_cleanup_timeout(), Duration::from_secs(10));
        assert_eq!(shutdown.task_cancel_timeout(), Duration::from_secs(5));
        assert_eq!(shutdown.settle_delay(), Duration::from_millis(500));
        assert!(!shutdown.concurrent_task_waits);
        assert!(shutdown.drain_on_unsignalled_exit);
    }

    #[test]
    fn test_socket_addr() {
        let bind = ServerBindConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(bind.socket_addr().unwrap().port(), 9000);

        let bad = ServerBindConfig {
            host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(bad.socket_addr().is_err());
    }

    #[test]
    fn test_logging_conversion_falls_back() {
        let logging = LoggingConfig {
            level: "bogus".to_string(),
            format: "json".to_string(),
            access_log: false,
            ..Default::default()
        };
        let converted = logging.to_log_config();
        assert_eq!(converted.level, warden_common_log::LogLevel::Info);
        assert_eq!(converted.format, warden_common_log::LogFormat::Json);
        assert!(!converted.access_log);
        assert!(!converted.source_location);
    }

    #[test]
    fn test_logging_detail_flags_reach_log_config() {
        let logging = LoggingConfig {
            source_location: true,
            span_events: true,
            ..Default::default()
        };
        let converted = logging.to_log_config();
        assert!(converted.source_location);
        assert!(converted.span_events);
    }
}
