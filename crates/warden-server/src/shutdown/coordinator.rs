//! Shutdown coordination.

use super::drain::{DrainExecutor, DrainOutcome, DrainSettings};
use super::registry::TaskRegistry;
use super::signal::{OsSignals, Signal, SignalSource};
use super::state::WorkerState;
use crate::app::ManagedApp;
use crate::config::ShutdownConfig;
use crate::error::ShutdownError;
use crate::serve::ServeLoop;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// How long an aborted drain is given to run its finalization.
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// What started a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// A termination signal was delivered.
    Signal(Signal),
    /// The worker served its request budget and should be recycled.
    RequestBudget,
    /// The serve-loop returned without being asked to stop.
    ServeLoopExit,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Signal(signal) => write!(f, "signal {signal}"),
            ShutdownTrigger::RequestBudget => f.write_str("request budget reached"),
            ShutdownTrigger::ServeLoopExit => f.write_str("serve-loop exit"),
        }
    }
}

/// Summary returned by [`ShutdownCoordinator::stop`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// The trigger that started the first drain, if any.
    pub trigger: Option<ShutdownTrigger>,
    /// Outcome of the last drain waited on. `None` when nothing drained.
    pub outcome: Option<DrainOutcome>,
    /// The drain was still running at the deadline and was aborted.
    pub deadline_exceeded: bool,
    /// Drain cycles started during the coordinator's lifetime.
    pub drain_cycles: u64,
}

struct CoordinatorInner {
    config: ShutdownConfig,
    settings: DrainSettings,
    state: Arc<WorkerState>,
    registry: TaskRegistry,
    app: Option<Arc<dyn ManagedApp>>,
    signals: Arc<dyn SignalSource>,
    span: Span,
    started: AtomicBool,
    stop_accepting: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    first_trigger: Mutex<Option<ShutdownTrigger>>,
}

/// Owns a worker's shutdown state and drives signal-initiated drains.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

/// Builder for [`ShutdownCoordinator`].
pub struct CoordinatorBuilder {
    config: ShutdownConfig,
    app: Option<Arc<dyn ManagedApp>>,
    registry: Option<TaskRegistry>,
    signals: Option<Arc<dyn SignalSource>>,
    span: Option<Span>,
}

impl CoordinatorBuilder {
    /// The application whose cleanup runs during each drain.
    pub fn app(mut self, app: Arc<dyn ManagedApp>) -> Self {
        self.app = Some(app);
        self
    }

    /// Share an existing task registry.
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a signal source other than the process's OS signals.
    pub fn signals(mut self, signals: impl SignalSource) -> Self {
        self.signals = Some(Arc::new(signals));
        self
    }

    /// Span that instruments all coordinator and drain work.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> ShutdownCoordinator {
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("worker", pid = std::process::id()));

        ShutdownCoordinator {
            inner: Arc::new(CoordinatorInner {
                settings: DrainSettings::from(&self.config),
                config: self.config,
                state: Arc::new(WorkerState::new()),
                registry: self.registry.unwrap_or_default(),
                app: self.app,
                signals: self.signals.unwrap_or_else(|| Arc::new(OsSignals)),
                span,
                started: AtomicBool::new(false),
                stop_accepting: CancellationToken::new(),
                listener: Mutex::new(None),
                first_trigger: Mutex::new(None),
            }),
        }
    }
}

/// Restores the captured signal disposition when dropped.
struct RestoreDisposition<'a> {
    state: &'a WorkerState,
}

impl Drop for RestoreDisposition<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.state.take_disposition() {
            match guard.restore() {
                Ok(()) => debug!("Signal disposition restored"),
                Err(e) => warn!(error = %e, "Failed to restore signal disposition"),
            }
        }
    }
}

impl ShutdownCoordinator {
    pub fn builder(config: ShutdownConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            app: None,
            registry: None,
            signals: None,
            span: None,
        }
    }

    /// Install the signal registration and start listening for deliveries.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), ShutdownError> {
        let inner = &self.inner;
        let _entered = inner.span.enter();

        if inner.state.is_shutdown_in_progress() {
            return Err(ShutdownError::DrainInProgress);
        }
        if inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShutdownError::AlreadyStarted);
        }

        let installed = match inner.signals.install() {
            Ok(installed) => installed,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        inner.state.set_disposition(installed.disposition);

        let weak = Arc::downgrade(&self.inner);
        let mut deliveries = installed.deliveries;
        let listener = tokio::spawn(
            async move {
                while let Some(signal) = deliveries.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    ShutdownCoordinator { inner }.on_signal(signal);
                }
            }
            .instrument(inner.span.clone()),
        );
        *inner.listener.lock() = Some(listener);

        info!("Shutdown coordinator started");
        Ok(())
    }

    /// Handle a delivered termination signal. Returns `true` if it started a drain.
    pub fn on_signal(&self, signal: Signal) -> bool {
        self.inner.span.in_scope(|| info!(%signal, "Received termination signal"));
        self.trigger(ShutdownTrigger::Signal(signal))
    }

    /// Start a drain unless one is already running.
    ///
    /// The drain is spawned before the serve-loop is told to stop accepting,
    /// and this call never waits on it. Returns `false` if a drain was
    /// already in progress; the deadline is left untouched in that case.
    pub fn trigger(&self, trigger: ShutdownTrigger) -> bool {
        let inner = &self.inner;
        let _entered = inner.span.enter();

        if !inner.state.try_begin_shutdown() {
            warn!(%trigger, "Shutdown already in progress, ignoring");
            return false;
        }

        let deadline = inner.state.fix_deadline(inner.config.ceiling());
        inner.first_trigger.lock().get_or_insert(trigger);
        info!(
            %trigger,
            ceiling_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Starting graceful shutdown"
        );

        let executor = DrainExecutor::new(
            Arc::clone(&inner.state),
            inner.registry.clone(),
            inner.app.clone(),
            inner.settings.clone(),
        );
        let handle = tokio::spawn(executor.run().instrument(inner.span.clone()));
        inner.state.set_cleanup_handle(handle);

        inner.stop_accepting.cancel();
        true
    }

    /// Wait for the scheduled drain until the deadline, then restore the
    /// signal disposition. Never fails; problems are logged.
    pub async fn stop(&self) -> ShutdownReport {
        self.stop_inner().instrument(self.inner.span.clone()).await
    }

    async fn stop_inner(&self) -> ShutdownReport {
        let inner = &self.inner;
        let state = &inner.state;
        let _restore = RestoreDisposition { state };

        if inner.config.drain_on_unsignalled_exit
            && inner.first_trigger.lock().is_none()
            && !state.is_shutdown_in_progress()
        {
            self.trigger(ShutdownTrigger::ServeLoopExit);
        }

        let mut outcome = None;
        let mut deadline_exceeded = false;

        while let Some(mut handle) = state.take_cleanup_handle() {
            let deadline = state
                .deadline()
                .unwrap_or_else(|| Instant::now() + inner.config.ceiling());
            let waited = tokio::time::timeout_at(deadline, &mut handle).await;
            match waited {
                Ok(Ok(drained)) => outcome = Some(drained),
                Ok(Err(e)) => {
                    warn!(error = %e, "Drain task failed");
                    outcome = Some(DrainOutcome::failed(format!("drain task failed: {e}")));
                }
                Err(_) => {
                    warn!(
                        ceiling_secs = inner.config.ceiling_secs,
                        "Drain did not finish before the shutdown deadline, aborting"
                    );
                    handle.abort();
                    let _ = tokio::time::timeout(ABORT_GRACE, handle).await;
                    if state.is_shutdown_in_progress() && !state.has_cleanup_handle() {
                        inner.registry.reopen();
                        state.finish_drain();
                    }
                    deadline_exceeded = true;
                    outcome = Some(DrainOutcome::timed_out("drain exceeded the shutdown deadline"));
                    break;
                }
            }
        }

        if let Some(listener) = inner.listener.lock().take() {
            listener.abort();
        }

        let report = ShutdownReport {
            trigger: *inner.first_trigger.lock(),
            outcome,
            deadline_exceeded,
            drain_cycles: state.drain_cycles(),
        };
        info!(
            trigger = ?report.trigger,
            status = ?report.outcome.as_ref().map(|o| o.status),
            deadline_exceeded,
            "Worker shutdown complete"
        );
        report
    }

    /// Supervise `serve_loop`: start, serve until it exits or is told to
    /// stop accepting, bound its wind-down by the deadline, then stop.
    ///
    /// A serve-loop error is returned after shutdown has completed.
    pub async fn run(&self, serve_loop: &dyn ServeLoop) -> anyhow::Result<ShutdownReport> {
        self.start()?;

        let token = self.stop_accepting_token();
        let state = Arc::clone(&self.inner.state);
        let wind_down_expired = {
            let token = token.clone();
            async move {
                token.cancelled().await;
                if let Some(deadline) = state.deadline() {
                    tokio::time::sleep_until(deadline).await;
                }
            }
        };

        let served = tokio::select! {
            result = AssertUnwindSafe(serve_loop.serve(token)).catch_unwind() => match result {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("serve-loop panicked")),
            },
            _ = wind_down_expired => {
                warn!(parent: &self.inner.span, "Serve-loop did not wind down before the shutdown deadline");
                Ok(())
            }
        };

        if let Err(e) = &served {
            warn!(parent: &self.inner.span, error = %e, "Serve-loop exited with an error");
        }

        let report = self.stop().await;
        served.map(|()| report)
    }

    /// `true` while a drain cycle owns the re-entrancy guard.
    pub fn is_draining(&self) -> bool {
        self.inner.state.is_shutdown_in_progress()
    }

    /// Receiver for the drain-in-flight marker.
    pub fn drain_in_flight(&self) -> watch::Receiver<bool> {
        self.inner.state.subscribe_drain()
    }

    /// Token cancelled when the serve-loop must stop accepting new work.
    pub fn stop_accepting_token(&self) -> CancellationToken {
        self.inner.stop_accepting.clone()
    }

    pub fn drain_cycles(&self) -> u64 {
        self.inner.state.drain_cycles()
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.inner.state
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.inner.config
    }
}
