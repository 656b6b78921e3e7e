//! Registry of cancellable background work.
//!
//! Every unit of concurrent work the worker owns is spawned through the
//! registry. It is tracked with its own [`CancellationToken`] until it
//! finishes, so a drain can sweep exactly the work that is still live.

use crate::error::RegistryError;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifier of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

struct TrackedTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

struct RegistryInner {
    tasks: DashMap<TaskId, TrackedTask>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Shared registry of background tasks.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

/// Summary of a cancellation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSweep {
    /// Tasks that finished or were aborted after cancellation.
    pub acknowledged: usize,
    /// Tasks that did not finish within their budget and were aborted.
    pub timed_out: Vec<String>,
    /// Tasks that returned an error or panicked.
    pub failed: Vec<String>,
}

impl TaskSweep {
    pub fn total(&self) -> usize {
        self.acknowledged + self.timed_out.len() + self.failed.len()
    }
}

enum TaskExit {
    Acknowledged,
    TimedOut(String),
    Failed(String),
}

/// Removes a task's entry when its future completes or is dropped.
struct Deregister {
    registry: Weak<RegistryInner>,
    id: TaskId,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.tasks.remove(&self.id);
        }
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn a tracked task. The closure receives the task's cancellation
    /// token; tasks are expected to return promptly once it fires.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> Result<TaskId, RegistryError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.is_closed() {
            return Err(RegistryError::Closed { name });
        }

        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let token = CancellationToken::new();
        let future = task(token.clone());

        // The task waits until it is tracked so its deregistration cannot
        // run before the insert below.
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
        let deregister = Deregister {
            registry: Arc::downgrade(&self.inner),
            id,
        };
        let task_name = name.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let _deregister = deregister;
            let _ = tracked_rx.await;
            let result = future.await;
            if let Err(e) = &result {
                if !task_token.is_cancelled() {
                    warn!(task = %task_name, error = %e, "Background task failed");
                }
            }
            result
        });

        self.inner.tasks.insert(id, TrackedTask { name: name.clone(), token, handle });
        let _ = tracked_tx.send(());
        debug!(task = %name, %id, "Registered background task");

        Ok(id)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    /// Names of live tasks, ordered by registration.
    pub fn names(&self) -> Vec<String> {
        let mut entries: Vec<_> = self
            .inner
            .tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().name.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, name)| name).collect()
    }

    /// Refuse new registrations.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Accept registrations again.
    pub fn reopen(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Cancel every live task, then wait for each to exit within
    /// `per_task`. A task still running after its budget is aborted and
    /// counted as timed out; it never holds up the others.
    pub async fn cancel_all(&self, per_task: Duration, concurrent: bool) -> TaskSweep {
        let mut ids: Vec<TaskId> = self.inner.tasks.iter().map(|entry| *entry.key()).collect();
        ids.sort();

        let tracked: Vec<TrackedTask> = ids
            .into_iter()
            .filter_map(|id| self.inner.tasks.remove(&id).map(|(_, task)| task))
            .collect();

        if tracked.is_empty() {
            return TaskSweep::default();
        }

        debug!(count = tracked.len(), concurrent, "Cancelling background tasks");
        for task in &tracked {
            task.token.cancel();
        }

        let waits = tracked.into_iter().map(|task| wait_for_exit(task, per_task));
        let exits = if concurrent {
            warden_common_async::join_all(waits).await
        } else {
            let mut exits = Vec::new();
            for wait in waits {
                exits.push(wait.await);
            }
            exits
        };

        let mut sweep = TaskSweep::default();
        for exit in exits {
            match exit {
                TaskExit::Acknowledged => sweep.acknowledged += 1,
                TaskExit::TimedOut(name) => sweep.timed_out.push(name),
                TaskExit::Failed(name) => sweep.failed.push(name),
            }
        }
        sweep
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_exit(mut task: TrackedTask, budget: Duration) -> TaskExit {
    let waited = tokio::time::timeout(budget, &mut task.handle).await;
    match waited {
        Ok(Ok(Ok(()))) => {
            debug!(task = %task.name, "Task acknowledged cancellation");
            TaskExit::Acknowledged
        }
        Ok(Ok(Err(e))) => {
            warn!(task = %task.name, error = %e, "Task failed while cancelling");
            TaskExit::Failed(task.name)
        }
        Ok(Err(join)) if join.is_cancelled() => TaskExit::Acknowledged,
        Ok(Err(join)) => {
            warn!(task = %task.name, error = %join, "Task panicked while cancelling");
            TaskExit::Failed(task.name)
        }
        Err(_) => {
            warn!(
                task = %task.name,
                budget_ms = budget.as_millis() as u64,
                "Task did not acknowledge cancellation, aborting"
            );
            task.handle.abort();
            TaskExit::TimedOut(task.name)
        }
    }
}
