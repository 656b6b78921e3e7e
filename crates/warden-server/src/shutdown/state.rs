//! Per-process shutdown state.

use super::drain::DrainOutcome;
use super::signal::DispositionGuard;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shutdown state owned by one worker process's coordinator.
///
/// `drain_in_flight` is `true` from the moment a drain starts until its
/// finalization runs, whatever the outcome. Observers waiting for "drain
/// finished" wait for the `true -> false` edge.
pub struct WorkerState {
    shutdown_in_progress: AtomicBool,
    cleanup_handle: Mutex<Option<JoinHandle<DrainOutcome>>>,
    disposition: Mutex<Option<DispositionGuard>>,
    drain_in_flight: watch::Sender<bool>,
    deadline: Mutex<Option<Instant>>,
    drain_cycles: AtomicU64,
}

impl WorkerState {
    pub fn new() -> Self {
        let (drain_in_flight, _) = watch::channel(false);
        Self {
            shutdown_in_progress: AtomicBool::new(false),
            cleanup_handle: Mutex::new(None),
            disposition: Mutex::new(None),
            drain_in_flight,
            deadline: Mutex::new(None),
            drain_cycles: AtomicU64::new(0),
        }
    }

    /// Claim the re-entrancy guard. Returns `false` if a drain already owns it.
    pub(crate) fn try_begin_shutdown(&self) -> bool {
        self.shutdown_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_drain_started(&self) {
        self.drain_cycles.fetch_add(1, Ordering::SeqCst);
        self.drain_in_flight.send_replace(true);
    }

    /// Finalization for a drain cycle: clears the marker and the guard.
    pub(crate) fn finish_drain(&self) {
        self.drain_in_flight.send_replace(false);
        self.shutdown_in_progress.store(false, Ordering::SeqCst);
    }

    pub fn is_drain_in_flight(&self) -> bool {
        *self.drain_in_flight.borrow()
    }

    pub fn subscribe_drain(&self) -> watch::Receiver<bool> {
        self.drain_in_flight.subscribe()
    }

    /// Number of drain cycles started in this process.
    pub fn drain_cycles(&self) -> u64 {
        self.drain_cycles.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cleanup_handle(&self, handle: JoinHandle<DrainOutcome>) {
        *self.cleanup_handle.lock() = Some(handle);
    }

    pub(crate) fn take_cleanup_handle(&self) -> Option<JoinHandle<DrainOutcome>> {
        self.cleanup_handle.lock().take()
    }

    pub(crate) fn has_cleanup_handle(&self) -> bool {
        self.cleanup_handle.lock().is_some()
    }

    pub(crate) fn set_disposition(&self, guard: DispositionGuard) {
        *self.disposition.lock() = Some(guard);
    }

    pub(crate) fn take_disposition(&self) -> Option<DispositionGuard> {
        self.disposition.lock().take()
    }

    /// Fix the shutdown deadline on first call; later calls keep it.
    pub(crate) fn fix_deadline(&self, ceiling: Duration) -> Instant {
        *self
            .deadline
            .lock()
            .get_or_insert_with(|| Instant::now() + ceiling)
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}
