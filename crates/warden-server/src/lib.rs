//! Warden worker
//!
//! Supervises one worker process of a multi-worker network service and shuts
//! it down gracefully on termination signals.
//!
//! # Architecture
//!
//! - **Shutdown**: the coordinator owns per-process shutdown state, listens
//!   for SIGTERM/SIGINT and schedules one bounded drain per shutdown episode.
//! - **Drain**: application cleanup, a cancellation sweep over the task
//!   registry, then a settle delay. Finalization always runs.
//! - **Serve**: the serve-loop seam and the HTTP implementation with
//!   request-count recycling.
//! - **Config**: layered configuration with validation.

#![warn(clippy::all)]

pub mod app;
pub mod config;
pub mod error;
pub mod serve;
pub mod shutdown;

pub use app::{ManagedApp, SessionHandle, SessionPool};
pub use config::{load_config, ConfigLoader, WorkerConfig};
pub use error::{RegistryError, ShutdownError, SignalError};
pub use serve::{HttpServeLoop, RequestBudget, ServeLoop};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownTrigger, TaskRegistry};
