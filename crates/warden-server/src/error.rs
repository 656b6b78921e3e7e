//! Error types for the shutdown core.

use thiserror::Error;

/// Errors returned by [`ShutdownCoordinator`](crate::shutdown::ShutdownCoordinator).
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("coordinator already started")]
    AlreadyStarted,

    #[error("cannot start while a drain is in progress")]
    DrainInProgress,

    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Errors from installing or restoring signal dispositions.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal handlers already installed in this process")]
    AlreadyInstalled,

    #[error("failed to register signal listener: {0}")]
    Install(#[from] std::io::Error),

    #[cfg(unix)]
    #[error("failed to change signal disposition: {0}")]
    Disposition(#[from] nix::errno::Errno),
}

/// Errors from the task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task registry is closed while draining; refused to spawn {name}")]
    Closed { name: String },
}
