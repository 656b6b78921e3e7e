//! Logging infrastructure for Warden workers.
//!
//! Diagnostic events go to stderr. Events emitted under [`ACCESS_TARGET`]
//! are access lines and go to stdout, so a process supervisor can route the
//! two streams separately.

use tracing::Subscriber;
use tracing_subscriber::{
    filter::filter_fn,
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target used for per-request access lines.
pub const ACCESS_TARGET: &str = "warden::access";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level.
    pub level: LogLevel,
    /// Output format for diagnostic events.
    pub format: LogFormat,
    /// Emit access lines to stdout.
    pub access_log: bool,
    /// Include source location.
    pub source_location: bool,
    /// Include span events.
    pub span_events: bool,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        }
    }
}

impl LogLevel {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with targets.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON structured format.
    Json,
}

impl LogFormat {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            access_log: true,
            source_location: false,
            span_events: false,
        }
    }
}

/// Initialize process-wide logging. Call once, before the runtime starts.
pub fn init(config: LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let diagnostics = diagnostic_layer(config.format, std::io::stderr, config.source_location, span_events)
        .with_filter(filter_fn(|meta| meta.target() != ACCESS_TARGET));

    let access = config.access_log.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_level(false)
            .with_filter(filter_fn(|meta| meta.target() == ACCESS_TARGET))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(diagnostics)
        .with(access)
        .try_init()
        .map_err(|e| LogError::InitError(e.to_string()))
}

fn diagnostic_layer<S, W>(
    format: LogFormat,
    writer: W,
    source_location: bool,
    span_events: FmtSpan,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_file(source_location)
        .with_line_number(source_location)
        .with_span_events(span_events);

    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_target(true).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(true).boxed(),
        LogFormat::Json => layer.json().with_ansi(false).boxed(),
    }
}

/// Logging errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to initialize logging: {0}")]
    InitError(String),
}
