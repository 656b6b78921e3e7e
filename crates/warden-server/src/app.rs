//! The managed application seam and the worker's outbound session pool.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The application served by a worker.
///
/// Cleanup is an optional capability: returning `None` means the application
/// has nothing to release and the drain skips the stage.
pub trait ManagedApp: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn cleanup(&self) -> Option<BoxFuture<'_, anyhow::Result<()>>> {
        None
    }
}

/// Outbound sessions (upstream HTTP clients, database links) opened on behalf
/// of requests. Closing the pool signals every open session to shut down.
#[derive(Clone, Default)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    sessions: DashMap<u64, SessionEntry>,
    next_id: AtomicU64,
}

struct SessionEntry {
    target: String,
    closer: CancellationToken,
    last_used: Arc<Mutex<Instant>>,
}

/// A live outbound session. Dropping it returns its slot to the pool.
pub struct SessionHandle {
    id: u64,
    closer: CancellationToken,
    last_used: Arc<Mutex<Instant>>,
    pool: Arc<PoolInner>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record activity so the idle reaper leaves the session alone.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once the pool closes this session.
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.pool.sessions.remove(&self.id);
    }
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session towards `target`.
    pub fn open(&self, target: impl Into<String>) -> SessionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let closer = CancellationToken::new();
        let last_used = Arc::new(Mutex::new(Instant::now()));
        let target = target.into();
        debug!(session = id, target = %target, "Opened outbound session");

        self.inner.sessions.insert(
            id,
            SessionEntry {
                target,
                closer: closer.clone(),
                last_used: Arc::clone(&last_used),
            },
        );

        SessionHandle {
            id,
            closer,
            last_used,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of open sessions.
    pub fn open_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Close every open session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<u64> = self.inner.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.inner.sessions.remove(&id) {
                debug!(session = id, target = %entry.target, "Closing outbound session");
                entry.closer.cancel();
                closed += 1;
            }
        }
        closed
    }

    /// Close sessions idle for longer than `max_idle`. Returns how many.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let idle: Vec<u64> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| now.duration_since(*entry.value().last_used.lock()) > max_idle)
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in idle {
            if let Some((_, entry)) = self.inner.sessions.remove(&id) {
                entry.closer.cancel();
                reaped += 1;
            }
        }
        reaped
    }

    /// Periodically reap idle sessions until `token` is cancelled.
    pub async fn run_reaper(
        self,
        max_idle: Duration,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(max_idle.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    let reaped = self.reap_idle(max_idle);
                    if reaped > 0 {
                        debug!(reaped, "Reaped idle outbound sessions");
                    }
                }
            }
        }
    }
}

impl ManagedApp for SessionPool {
    fn name(&self) -> &str {
        "session-pool"
    }

    fn cleanup(&self) -> Option<BoxFuture<'_, anyhow::Result<()>>> {
        Some(Box::pin(async move {
            let closed = self.close_all();
            info!(closed, "Closed outbound sessions");
            Ok(())
        }))
    }
}
