use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep},
};
use tracing::trace;

/// Identifier of a task spawned in a [`TaskScope`].
pub type TaskId = u64;

#[derive(Default)]
struct ScopeInner {
    next_id: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<HashMap<TaskId, (&'static str, JoinHandle<()>)>>,
}

impl ScopeInner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, (&'static str, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of the background tasks owned by one live session.
///
/// Every timer, poller and stream reader runs inside a scope. [`TaskScope::cancel_all`]
/// aborts all of them synchronously and closes the scope, so work scheduled by a callback
/// that was already running cannot outlive the teardown.
#[derive(Clone, Default)]
pub struct TaskScope {
    inner: Arc<ScopeInner>,
}

impl TaskScope {
    /// Empty, open scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task. Returns `None` once the scope has been cancelled.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> Option<TaskId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            trace!(task = name, "scope closed; task not spawned");
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<ScopeInner> = Arc::downgrade(&self.inner);

        // Insert while holding the lock so a task finishing immediately cannot remove
        // itself before it is registered.
        let mut tasks = self.inner.tasks();
        let handle = tokio::spawn(async move {
            task.await;
            if let Some(inner) = registry.upgrade() {
                inner.tasks().remove(&id);
            }
        });
        tasks.insert(id, (name, handle));
        Some(id)
    }

    /// Run `tick` every `period`, the first time one period from now.
    pub fn spawn_interval<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        mut tick: F,
    ) -> Option<TaskId>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        })
    }

    /// Run `task` once after `delay`.
    pub fn spawn_after<F>(&self, name: &'static str, delay: Duration, task: F) -> Option<TaskId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            sleep(delay).await;
            task.await;
        })
    }

    /// Abort one task; returns whether it was still registered.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.inner.tasks().remove(&id) {
            Some((name, handle)) => {
                trace!(task = name, "task cancelled");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every task and refuse new ones.
    pub fn cancel_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.inner.tasks().drain().collect();
        for (_, (name, handle)) in drained {
            trace!(task = name, "task cancelled");
            handle.abort();
        }
    }

    /// Number of tasks still registered.
    pub fn active(&self) -> usize {
        self.inner.tasks().len()
    }

    /// Cancelled; new spawns are refused.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
