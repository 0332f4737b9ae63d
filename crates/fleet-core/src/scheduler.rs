//! # Delayed-action scheduler.
//!
//! Arms one timer per task id and runs a single store mutation when it fires. The caller never
//! waits: [`DelayedScheduler::schedule`] returns as soon as the timer is armed.
//!
//! ```text
//! schedule(id, wait_stop, wait, action)
//!   └─ spawn ─► [wait_stop: old task past Running or deleted]
//!               └─► sleep(wait) ─► action(store)  (sync, runs to completion)
//!                                  └─ Err → warn!, dropped
//! cancel(id) / shutdown()  → token.cancel()   (only interrupts the waits)
//! ```
//!
//! ## Rules
//! - At most one outstanding action per id: re-arming an id cancels the previous timer.
//! - A fired action is never interrupted; cancellation only reaches the waits before it.
//! - Failed actions are not retried. The next reconciliation pass corrects any drift.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fleet_model::{TaskId, TaskState};
use fleet_store::{Event, EventKind, MemoryStore, ReadTx, StoreError};

use crate::CoreError;

/// Handle to an armed action.
struct Pending {
    token: CancellationToken,
    join: JoinHandle<()>,
    /// Arming sequence; guards the self-removal of a timer that was re-armed meanwhile.
    seq: u64,
}

type Arena = Arc<Mutex<HashMap<TaskId, Pending>>>;

fn lock(arena: &Arena) -> MutexGuard<'_, HashMap<TaskId, Pending>> {
    arena.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancellable timers that mutate the store after a delay.
pub struct DelayedScheduler {
    store: Arc<MemoryStore>,
    pending: Arena,
    seq: AtomicU64,
    root: CancellationToken,
}

impl DelayedScheduler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
            root: CancellationToken::new(),
        }
    }

    /// Moves `task_id` to `desired_state = Running` after `wait`.
    ///
    /// With `wait_stop`, the wait only starts once that task is past `Running` or deleted.
    pub fn start_after(&self, task_id: TaskId, wait_stop: Option<TaskId>, wait: Duration) {
        let id = task_id.clone();
        self.schedule(task_id, wait_stop, wait, move |store| {
            if start_now(store, &id)? {
                debug!(task = %id, "task started");
            }
            Ok(())
        });
    }

    /// Arms `action` under `key`, replacing any action already armed under it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: TaskId, wait_stop: Option<TaskId>, wait: Duration, action: F)
    where
        F: FnOnce(&MemoryStore) -> Result<(), CoreError> + Send + 'static,
    {
        let token = self.root.child_token();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let arena = Arc::clone(&self.pending);

        let mut pending = lock(&self.pending);
        let join = tokio::spawn({
            let token = token.clone();
            let key = key.clone();
            async move {
                if arm(&store, &token, wait_stop.as_ref(), wait).await {
                    if let Err(e) = action(&store) {
                        warn!(task = %key, error = %e, label = e.as_label(), "delayed action failed");
                    }
                } else {
                    debug!(task = %key, "delayed action cancelled");
                }

                let mut pending = lock(&arena);
                if pending.get(&key).is_some_and(|p| p.seq == seq) {
                    pending.remove(&key);
                }
            }
        });

        if let Some(prev) = pending.insert(key, Pending { token, join, seq }) {
            prev.token.cancel();
        }
    }

    /// Cancels the action armed under `key`; returns `false` if there was none.
    pub fn cancel(&self, key: &TaskId) -> bool {
        match lock(&self.pending).remove(key) {
            Some(p) => {
                p.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &TaskId) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// Number of armed actions.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    /// Cancels every armed action and waits for their tasks to finish.
    ///
    /// Actions already firing complete first. Later `schedule` calls are cancelled on arrival.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<(TaskId, Pending)> = lock(&self.pending).drain().collect();

        for (_, p) in &drained {
            p.token.cancel();
        }
        for (key, p) in drained {
            if let Err(e) = p.join.await
                && e.is_panic()
            {
                warn!(task = %key, "delayed action panicked");
            }
        }
    }
}

/// Waits out `wait_stop` and `wait`; returns `false` if cancelled first.
async fn arm(
    store: &MemoryStore,
    token: &CancellationToken,
    wait_stop: Option<&TaskId>,
    wait: Duration,
) -> bool {
    if let Some(old) = wait_stop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return false,
            res = wait_stopped(store, old) => {
                if let Err(e) = res {
                    debug!(task = %old, error = %e, "stop watch ended early");
                    return false;
                }
            }
        }
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Resolves once `id` is past `Running` or gone from the store.
async fn wait_stopped(store: &MemoryStore, id: &TaskId) -> Result<(), StoreError> {
    loop {
        // Subscribe before reading so a transition between the two is not missed.
        let mut watch = store.watch(&[EventKind::TaskUpdate, EventKind::TaskDelete])?;
        if store.view(|v| v.get_task(id).is_none_or(|t| t.status.state.is_terminal())) {
            return Ok(());
        }

        loop {
            match watch.recv().await {
                Ok(Event::TaskUpdate(t)) if &t.id == id && t.status.state.is_terminal() => {
                    return Ok(());
                }
                Ok(Event::TaskDelete(t)) if &t.id == id => return Ok(()),
                Ok(_) => continue,
                Err(StoreError::WatchLagged(_)) => break,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sets `desired_state = Running` on a task that is still waiting at `Ready` or below.
///
/// Returns `false` if the task is gone or was moved on by someone else.
pub fn start_now(store: &MemoryStore, id: &TaskId) -> Result<bool, StoreError> {
    store.update(|tx| {
        let Some(mut task) = tx.get_task(id) else {
            return Ok(false);
        };
        if task.desired_state > TaskState::Ready {
            return Ok(false);
        }
        task.desired_state = TaskState::Running;
        tx.update_task(task)?;
        Ok(true)
    })
}
