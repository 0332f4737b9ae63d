//! # Restart supervisor.
//!
//! Decides the fate of a task that reached a terminal status and keeps the per-slot history
//! those decisions depend on.
//!
//! ```text
//! terminal task ──► handle_terminal_task(tx)
//!                     ├─ desired_state = Shutdown            (always)
//!                     ├─ condition rejects state   → stays terminal
//!                     ├─ attempts ≥ max_attempts   → stays terminal
//!                     └─ otherwise                 → create replacement (desired Ready)
//!                                                    return PlannedRestart
//! commit ok ──► confirm(planned)   → history.record_failure
//!           ──► realize(delay)     → scheduler.start_after(replacement, wait)
//! ```
//!
//! History is only written after the transaction committed, so a retried transaction never
//! counts the same failure twice.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use fleet_model::{ServiceId, Task, TaskId, TaskState};
use fleet_store::{ReadTx, Tx};

use super::delay::{Jitter, RestartDelay, task_restart_delay};
use super::history::{RestartHistory, SlotKey};
use crate::CoreError;

/// Why a terminated task is left terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The restart condition does not cover the terminal state.
    Condition,
    /// The slot used up `max_attempts`.
    AttemptsExhausted,
}

impl TerminateReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            TerminateReason::Condition => "condition",
            TerminateReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

/// Outcome of evaluating a terminated task against its restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Terminate(TerminateReason),
    Restart(RestartDelay),
}

/// A replacement created inside a transaction, to be confirmed and started after commit.
#[derive(Debug, Clone)]
pub struct PlannedRestart {
    /// The task being replaced, as written by the transaction.
    pub old: Task,
    pub replacement: Task,
    pub delay: RestartDelay,
    /// Task that must stop running before the replacement's delay starts.
    pub wait_stop: Option<TaskId>,
}

/// Restart decision engine with in-memory per-slot history.
#[derive(Debug)]
pub struct RestartSupervisor {
    history: Mutex<RestartHistory>,
    jitter: Jitter,
}

impl RestartSupervisor {
    pub fn new(jitter: Jitter) -> Self {
        Self {
            history: Mutex::new(RestartHistory::new()),
            jitter,
        }
    }

    fn history(&self) -> MutexGuard<'_, RestartHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluates `task`'s own restart policy against its slot's history at `now`.
    pub fn decide(&self, task: &Task, now: Instant) -> RestartDecision {
        let policy = &task.spec.restart;
        if !policy.condition.allows(task.status.state) {
            return RestartDecision::Terminate(TerminateReason::Condition);
        }

        let key = SlotKey::of(task);
        let mut history = self.history();
        if policy.max_attempts > 0 {
            let restarts = history.counted_restarts(&key, task.spec_version, policy, now);
            if restarts >= policy.max_attempts {
                return RestartDecision::Terminate(TerminateReason::AttemptsExhausted);
            }
        }

        let failures = history.failures_since_success(&key, task.spec_version);
        RestartDecision::Restart(task_restart_delay(policy, failures))
    }

    /// Restart delay of `task`'s slot as it stands now, before randomization.
    pub fn task_restart_delay(&self, task: &Task) -> RestartDelay {
        task_restart_delay(&task.spec.restart, self.failures_since_success(task))
    }

    pub fn failures_since_success(&self, task: &Task) -> u64 {
        self.history()
            .failures_since_success(&SlotKey::of(task), task.spec_version)
    }

    /// Handles a task that reached a terminal status, inside `tx`.
    ///
    /// Tasks that are already being shut down or removed, or whose status is not terminal,
    /// are left alone. Every handled task gets `desired_state = Shutdown`; eligible ones get
    /// a replacement created from the service's current template.
    #[instrument(level = "debug", skip_all, fields(task = %task_id))]
    pub fn handle_terminal_task(
        &self,
        tx: &mut Tx<'_>,
        task_id: &TaskId,
        now: Instant,
    ) -> Result<Option<PlannedRestart>, CoreError> {
        let Some(mut task) = tx.get_task(task_id) else {
            return Ok(None);
        };
        if task.desired_state > TaskState::Running || !task.status.state.is_terminal() {
            return Ok(None);
        }
        let Some(service) = tx.get_service(&task.service_id) else {
            return Err(CoreError::Invariant(format!(
                "task {} references missing service {}",
                task.id, task.service_id
            )));
        };

        task.desired_state = TaskState::Shutdown;
        tx.update_task(task.clone())?;

        match self.decide(&task, now) {
            RestartDecision::Terminate(reason) => {
                debug!(
                    service = %task.service_id,
                    slot = task.slot,
                    state = %task.status.state,
                    reason = reason.as_label(),
                    "task stays terminated"
                );
                Ok(None)
            }
            RestartDecision::Restart(delay) => {
                let replacement = Task::new_for_slot(&service, task.slot);
                tx.create_task(replacement.clone())?;

                info!(
                    service = %task.service_id,
                    slot = task.slot,
                    state = %task.status.state,
                    replacement = %replacement.id,
                    delay = ?delay.delay,
                    jitter = delay.jitter,
                    "restarting task"
                );
                Ok(Some(PlannedRestart {
                    old: task,
                    replacement,
                    delay,
                    wait_stop: None,
                }))
            }
        }
    }

    /// Records a committed restart in the slot's history.
    pub fn confirm(&self, planned: &PlannedRestart, now: Instant) {
        let replacement = &planned.replacement;
        self.history().record_failure(
            SlotKey::of(replacement),
            replacement.spec_version,
            &replacement.spec.restart,
            now,
        );
    }

    /// Wait the scheduler sleeps for before starting a replacement.
    pub fn realize(&self, delay: RestartDelay) -> Duration {
        self.jitter.realize(delay)
    }

    /// The slot's current task was observed running.
    pub fn record_success(&self, task: &Task) {
        self.history().record_success(&SlotKey::of(task));
    }

    pub fn reset_slot(&self, key: &SlotKey) {
        self.history().reset(key);
    }

    pub fn forget_service(&self, service_id: &ServiceId) {
        self.history().forget_service(service_id);
    }
}

impl Default for RestartSupervisor {
    fn default() -> Self {
        Self::new(Jitter::default())
    }
}
