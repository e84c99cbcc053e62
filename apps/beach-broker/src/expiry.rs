use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::trace;

/// One-shot, per-session timers. Each session has at most one pending task.
#[derive(Clone, Default)]
pub struct ExpiryScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    tasks: DashMap<String, ScheduledExpiry>,
    next_generation: AtomicU64,
}

struct ScheduledExpiry {
    generation: u64,
    handle: JoinHandle<()>,
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once `ttl` has elapsed unless the session is cancelled first.
    /// Scheduling an id that already has a pending task replaces it.
    pub fn schedule<F>(&self, session_id: &str, ttl: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let key = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            // Drop our own entry before running so the task can cancel freely.
            inner
                .tasks
                .remove_if(&key, |_, entry| entry.generation == generation);
            trace!(session_id = %key, "expiry timer fired");
            task.await;
        });

        let previous = self.inner.tasks.insert(
            session_id.to_string(),
            ScheduledExpiry { generation, handle },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Abort the pending task for `session_id`. Returns whether one existed.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.inner.tasks.remove(session_id) {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, session_id: &str) -> bool {
        self.inner
            .tasks
            .get(session_id)
            .map(|entry| !entry.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn pending(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    /// Abort everything; used on shutdown.
    pub fn abort_all(&self) {
        self.inner.tasks.retain(|_, entry| {
            entry.handle.abort();
            false
        });
    }
}
