//! Graceful shutdown handling.

mod coordinator;
mod drain;
mod registry;
mod signal;
mod state;

pub use coordinator::{CoordinatorBuilder, ShutdownCoordinator, ShutdownReport, ShutdownTrigger};
pub use drain::{DrainExecutor, DrainOutcome, DrainSettings, DrainStatus};
pub use registry::{TaskId, TaskRegistry, TaskSweep};
pub use signal::{
    block_termination_signals, ChannelSignals, DispositionGuard, Installed, OsSignals, Signal, SignalSender, SignalSource,
    SignalStream,
};
pub use state::WorkerState;
