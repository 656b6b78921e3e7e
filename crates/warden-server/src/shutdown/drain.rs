//! The drain sequence run once per shutdown episode.

use super::registry::{TaskRegistry, TaskSweep};
use super::state::WorkerState;
use crate::app::ManagedApp;
use crate::config::ShutdownConfig;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_common_async::with_timeout;

/// Terminal status of a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    Completed,
    TimedOut,
    Failed,
}

/// What a drain cycle achieved. Only logged; never persisted.
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    pub status: DrainStatus,
    pub message: Option<String>,
    pub sweep: TaskSweep,
}

impl DrainOutcome {
    pub fn completed() -> Self {
        Self {
            status: DrainStatus::Completed,
            message: None,
            sweep: TaskSweep::default(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        let mut outcome = Self::completed();
        outcome.record_timeout(message);
        outcome
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut outcome = Self::completed();
        outcome.record_failure(message);
        outcome
    }

    pub fn is_completed(&self) -> bool {
        self.status == DrainStatus::Completed
    }

    fn record_timeout(&mut self, message: impl Into<String>) {
        if self.status == DrainStatus::Completed {
            self.status = DrainStatus::TimedOut;
        }
        self.append(message.into());
    }

    fn record_failure(&mut self, message: impl Into<String>) {
        self.status = DrainStatus::Failed;
        self.append(message.into());
    }

    fn append(&mut self, message: String) {
        self.message = Some(match self.message.take() {
            Some(existing) => format!("{existing}; {message}"),
            None => message,
        });
    }
}

/// Timings for one drain cycle.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub app_cleanup_timeout: Duration,
    pub task_cancel_timeout: Duration,
    pub settle_delay: Duration,
    pub concurrent_task_waits: bool,
}

impl From<&ShutdownConfig> for DrainSettings {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            app_cleanup_timeout: config.app_cleanup_timeout(),
            task_cancel_timeout: config.task_cancel_timeout(),
            settle_delay: config.settle_delay(),
            concurrent_task_waits: config.concurrent_task_waits,
        }
    }
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self::from(&ShutdownConfig::default())
    }
}

/// Runs app cleanup, the task sweep and the settle delay, in that order.
pub struct DrainExecutor {
    state: Arc<WorkerState>,
    registry: TaskRegistry,
    app: Option<Arc<dyn ManagedApp>>,
    settings: DrainSettings,
}

/// Finalizes a drain cycle when dropped: on return, panic, or abort.
struct DrainCycle<'a> {
    state: &'a WorkerState,
    registry: &'a TaskRegistry,
}

impl<'a> DrainCycle<'a> {
    fn begin(state: &'a WorkerState, registry: &'a TaskRegistry) -> Self {
        state.mark_drain_started();
        registry.close();
        Self { state, registry }
    }
}

impl Drop for DrainCycle<'_> {
    fn drop(&mut self) {
        self.registry.reopen();
        self.state.finish_drain();
        debug!("Drain cycle finalized");
    }
}

impl DrainExecutor {
    pub fn new(
        state: Arc<WorkerState>,
        registry: TaskRegistry,
        app: Option<Arc<dyn ManagedApp>>,
        settings: DrainSettings,
    ) -> Self {
        Self {
            state,
            registry,
            app,
            settings,
        }
    }

    /// Run the drain. Never fails; problems are folded into the outcome.
    pub async fn run(self) -> DrainOutcome {
        let _cycle = DrainCycle::begin(&self.state, &self.registry);
        info!(tasks = self.registry.len(), "Drain started");

        let mut outcome = DrainOutcome::completed();

        self.cleanup_app(&mut outcome).await;

        let sweep = self
            .registry
            .cancel_all(
                self.settings.task_cancel_timeout,
                self.settings.concurrent_task_waits,
            )
            .await;
        if !sweep.timed_out.is_empty() {
            outcome.record_timeout(format!(
                "{} task(s) did not acknowledge cancellation: {}",
                sweep.timed_out.len(),
                sweep.timed_out.join(", ")
            ));
        }
        if !sweep.failed.is_empty() {
            outcome.record_failure(format!(
                "{} task(s) failed during cancellation: {}",
                sweep.failed.len(),
                sweep.failed.join(", ")
            ));
        }
        outcome.sweep = sweep;

        tokio::time::sleep(self.settings.settle_delay).await;

        info!(
            status = ?outcome.status,
            acknowledged = outcome.sweep.acknowledged,
            timed_out = outcome.sweep.timed_out.len(),
            failed = outcome.sweep.failed.len(),
            "Drain finished"
        );
        outcome
    }

    async fn cleanup_app(&self, outcome: &mut DrainOutcome) {
        let Some(app) = &self.app else {
            debug!("No managed application to clean up");
            return;
        };
        let cleanup = match std::panic::catch_unwind(AssertUnwindSafe(|| app.cleanup())) {
            Ok(Some(cleanup)) => cleanup,
            Ok(None) => {
                debug!(app = app.name(), "Application has no cleanup hook");
                return;
            }
            Err(_panic) => {
                warn!(app = app.name(), "Application cleanup panicked");
                outcome.record_failure("application cleanup panicked");
                return;
            }
        };

        let guarded = AssertUnwindSafe(cleanup).catch_unwind();
        match with_timeout(self.settings.app_cleanup_timeout, guarded).await {
            Ok(Ok(Ok(()))) => debug!(app = app.name(), "Application cleanup finished"),
            Ok(Ok(Err(e))) => {
                warn!(app = app.name(), error = %e, "Application cleanup failed");
                outcome.record_failure(format!("application cleanup failed: {e}"));
            }
            Ok(Err(_panic)) => {
                warn!(app = app.name(), "Application cleanup panicked");
                outcome.record_failure("application cleanup panicked");
            }
            Err(e) => {
                warn!(app = app.name(), error = %e, "Application cleanup timed out");
                outcome.record_timeout(format!("application cleanup {e}"));
            }
        }
    }
}
