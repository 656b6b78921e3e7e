//! Signal registration.
//!
//! A [`SignalSource`] is installed once by the coordinator. Installing yields
//! a stream of delivered signals and a [`DispositionGuard`] that puts the
//! previous disposition back when restored or dropped.

use crate::error::SignalError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Termination signals the coordinator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGTERM, the graceful-terminate request from a supervisor.
    Terminate,
    /// SIGINT (Ctrl-C).
    Interrupt,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiving half of an installed registration.
pub type SignalStream = mpsc::UnboundedReceiver<Signal>;

/// Result of installing a [`SignalSource`].
pub struct Installed {
    /// Signals as they are delivered. Duplicates are not coalesced.
    pub deliveries: SignalStream,
    /// Restores the disposition that was in place before installation.
    pub disposition: DispositionGuard,
}

/// Something that can override signal delivery for this process.
pub trait SignalSource: Send + Sync + 'static {
    /// Capture the current disposition, override it, and start delivering.
    fn install(&self) -> Result<Installed, SignalError>;
}

type RestoreFn = Box<dyn FnOnce() -> Result<(), SignalError> + Send>;

/// Restores a captured signal disposition exactly once.
///
/// Dropping the guard restores too, so the previous disposition comes back on
/// every exit path including unwinding.
pub struct DispositionGuard {
    restore: Option<RestoreFn>,
}

impl DispositionGuard {
    pub fn new(restore: impl FnOnce() -> Result<(), SignalError> + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    /// Restore now, reporting failure to the caller.
    pub fn restore(mut self) -> Result<(), SignalError> {
        match self.restore.take() {
            Some(restore) => restore(),
            None => Ok(()),
        }
    }
}

impl Drop for DispositionGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            if let Err(e) = restore() {
                warn!(error = %e, "Failed to restore signal disposition");
            }
        }
    }
}

impl fmt::Debug for DispositionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispositionGuard")
            .field("armed", &self.restore.is_some())
            .finish()
    }
}

/// Block SIGTERM and SIGINT on the calling thread.
///
/// The signal mask is per-thread and inherited by threads spawned later.
/// Calling this on the main thread before building a multi-thread runtime
/// leaves every runtime thread with both signals blocked, so they are only
/// delivered to the thread that installs [`OsSignals`], which unblocks them
/// once its handler is in place.
#[cfg(unix)]
pub fn block_termination_signals() -> Result<(), SignalError> {
    use nix::sys::signal::{pthread_sigmask, SigmaskHow};

    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&termination_mask()), None)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn block_termination_signals() -> Result<(), SignalError> {
    Ok(())
}

#[cfg(unix)]
fn termination_mask() -> nix::sys::signal::SigSet {
    use nix::sys::signal::{SigSet, Signal as NixSignal};

    let mut mask = SigSet::empty();
    mask.add(NixSignal::SIGTERM);
    mask.add(NixSignal::SIGINT);
    mask
}

/// OS signal delivery for SIGTERM and SIGINT.
///
/// Tokio keeps its own handler registered for the life of the process, so a
/// process may install this source only once.
///
/// The disposition swap is only atomic for threads that have both signals
/// blocked. Other threads with them unblocked may receive a signal while the
/// default action is briefly in place; see [`block_termination_signals`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignals;

static OS_SIGNALS_INSTALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
impl SignalSource for OsSignals {
    fn install(&self) -> Result<Installed, SignalError> {
        use nix::sys::signal::{
            pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow,
            Signal as NixSignal,
        };
        use tokio::signal::unix::{signal, SignalKind};

        if OS_SIGNALS_INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(SignalError::AlreadyInstalled);
        }

        let wanted = [
            (Signal::Terminate, NixSignal::SIGTERM, SignalKind::terminate()),
            (Signal::Interrupt, NixSignal::SIGINT, SignalKind::interrupt()),
        ];

        let mask = termination_mask();

        // Blocked on this thread only. Signals aimed at it during the swap stay
        // pending and reach the new handler.
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut previous = Vec::with_capacity(wanted.len());
        let mut forwarders = Vec::with_capacity(wanted.len());
        let mut failure = None;

        for (ours, nix_signal, kind) in wanted {
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: installs the default disposition, no handler code runs.
            let old = match unsafe { sigaction(nix_signal, &default) } {
                Ok(old) => old,
                Err(e) => {
                    failure = Some(SignalError::from(e));
                    break;
                }
            };
            previous.push((nix_signal, old));

            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    failure = Some(SignalError::from(e));
                    break;
                }
            };
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(ours).is_err() {
                        break;
                    }
                }
            }));
        }

        let restore = move || {
            for forwarder in &forwarders {
                forwarder.abort();
            }
            let mut result = Ok(());
            for (nix_signal, old) in previous.iter().rev() {
                // SAFETY: reinstates an action previously returned by sigaction.
                if let Err(e) = unsafe { sigaction(*nix_signal, old) } {
                    result = Err(SignalError::from(e));
                }
            }
            debug!("Restored SIGTERM/SIGINT dispositions");
            result
        };

        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None)?;

        if let Some(e) = failure {
            restore()?;
            return Err(e);
        }

        Ok(Installed {
            deliveries: rx,
            disposition: DispositionGuard::new(restore),
        })
    }
}

#[cfg(not(unix))]
impl SignalSource for OsSignals {
    fn install(&self) -> Result<Installed, SignalError> {
        if OS_SIGNALS_INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(SignalError::AlreadyInstalled);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Signal::Interrupt).is_err() {
                    break;
                }
            }
        });

        Ok(Installed {
            deliveries: rx,
            disposition: DispositionGuard::new(move || {
                forwarder.abort();
                Ok(())
            }),
        })
    }
}

/// In-process signal source. Signals are injected through a
/// [`SignalSender`]; useful for embedding and tests.
#[derive(Clone)]
pub struct ChannelSignals {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    tx: mpsc::UnboundedSender<Signal>,
    rx: Mutex<Option<SignalStream>>,
    installs: AtomicUsize,
    restores: AtomicUsize,
}

/// Injects signals into a [`ChannelSignals`] source.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSender {
    /// Deliver a signal. Returns `false` once the source is gone.
    pub fn send(&self, signal: Signal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

impl ChannelSignals {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                tx,
                rx: Mutex::new(Some(rx)),
                installs: AtomicUsize::new(0),
                restores: AtomicUsize::new(0),
            }),
        }
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            tx: self.inner.tx.clone(),
        }
    }

    /// Number of successful installs.
    pub fn install_count(&self) -> usize {
        self.inner.installs.load(Ordering::SeqCst)
    }

    /// Number of times the previous disposition was restored.
    pub fn restore_count(&self) -> usize {
        self.inner.restores.load(Ordering::SeqCst)
    }
}

impl Default for ChannelSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for ChannelSignals {
    fn install(&self) -> Result<Installed, SignalError> {
        let deliveries = self
            .inner
            .rx
            .lock()
            .take()
            .ok_or(SignalError::AlreadyInstalled)?;
        self.inner.installs.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        Ok(Installed {
            deliveries,
            disposition: DispositionGuard::new(move || {
                inner.restores.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_signals_deliver_in_order() {
        let source = ChannelSignals::new();
        let sender = source.sender();
        let mut installed = source.install().unwrap();

        assert!(sender.send(Signal::Terminate));
        assert!(sender.send(Signal::Interrupt));

        assert_eq!(installed.deliveries.recv().await, Some(Signal::Terminate));
        assert_eq!(installed.deliveries.recv().await, Some(Signal::Interrupt));
    }

    #[test]
    fn test_channel_signals_install_once() {
        let source = ChannelSignals::new();
        let _installed = source.install().unwrap();

        assert!(matches!(source.install(), Err(SignalError::AlreadyInstalled)));
        assert_eq!(source.install_count(), 1);
    }

    #[test]
    fn test_guard_restores_exactly_once() {
        let source = ChannelSignals::new();
        let installed = source.install().unwrap();

        installed.disposition.restore().unwrap();
        assert_eq!(source.restore_count(), 1);
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let source = ChannelSignals::new();
        {
            let _installed = source.install().unwrap();
        }
        assert_eq!(source.restore_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_blocked_mask_is_inherited_by_spawned_threads() {
        use nix::sys::signal::{SigSet, Signal as NixSignal};

        std::thread::spawn(|| {
            block_termination_signals().unwrap();
            let own = SigSet::thread_get_mask().unwrap();
            let inherited = std::thread::spawn(|| SigSet::thread_get_mask().unwrap())
                .join()
                .unwrap();

            for mask in [own, inherited] {
                assert!(mask.contains(NixSignal::SIGTERM));
                assert!(mask.contains(NixSignal::SIGINT));
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
        assert_eq!(Signal::Interrupt.name(), "SIGINT");
    }
}
