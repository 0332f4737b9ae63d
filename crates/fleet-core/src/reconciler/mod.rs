//! # Replica reconciler.
//!
//! Turns a [`ServicePlan`] into store writes inside the caller's transaction and reports the
//! side effects that must only happen once the transaction committed.
//!
//! ```text
//! reconcile_service(tx, id)
//!   ├─ plan_service(service, tasks)
//!   ├─ create     → new task (desired Ready)              → reset slot, start now
//!   ├─ recreate   → old deleted (New) or desired Shutdown → reset slot, start after old stops
//!   ├─ remove     → delete (New / terminal) or mark Remove → reset slot, cancel start
//!   └─ reap       → delete
//! ```

mod plan;
pub use plan::{ServicePlan, plan_service};

use tracing::{debug, info, instrument};

use fleet_model::{ServiceId, Task, TaskId, TaskState};
use fleet_store::{ReadTx, Tx};

use crate::CoreError;
use crate::restart::SlotKey;

/// Post-commit side effects of a reconciliation step.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Applied {
    /// Tasks to start, each optionally after another task stopped.
    pub starts: Vec<(TaskId, Option<TaskId>)>,
    /// Slots whose restart history must be dropped.
    pub resets: Vec<SlotKey>,
    /// Tasks whose pending start must be cancelled.
    pub cancels: Vec<TaskId>,
    /// Services whose restart history must be dropped entirely.
    pub forget: Vec<ServiceId>,
}

impl Applied {
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
            && self.resets.is_empty()
            && self.cancels.is_empty()
            && self.forget.is_empty()
    }
}

/// `true` if the task may be executing on a node, so its successor has to wait for it.
fn may_be_running(task: &Task) -> bool {
    (TaskState::Assigned..=TaskState::Running).contains(&task.status.state)
}

/// `true` if the task can be deleted right away instead of being marked for removal.
fn deletable(task: &Task) -> bool {
    task.status.state == TaskState::New || task.status.state.is_terminal()
}

/// Keeps every service at its replica count, running its current template.
#[derive(Debug, Clone)]
pub struct Reconciler {
    history_limit: usize,
}

impl Reconciler {
    pub fn new(history_limit: usize) -> Self {
        Self { history_limit }
    }

    /// Converges one service inside `tx`.
    ///
    /// A service that no longer exists is left to [`remove_service_tasks`](Self::remove_service_tasks).
    #[instrument(level = "debug", skip_all, fields(service = %service_id))]
    pub fn reconcile_service(
        &self,
        tx: &mut Tx<'_>,
        service_id: &ServiceId,
    ) -> Result<Applied, CoreError> {
        let mut applied = Applied::default();
        let Some(service) = tx.get_service(service_id) else {
            return Ok(applied);
        };
        let tasks = tx.tasks_by_service(service_id);
        let plan = plan_service(&service, &tasks, self.history_limit);
        if plan.is_empty() {
            return Ok(applied);
        }

        for slot in &plan.create {
            let task = Task::new_for_slot(&service, *slot);
            debug!(slot, task = %task.id, "creating task");
            // A refilled slot starts over, whatever it went through before it was freed.
            applied.resets.push(SlotKey::new(service.id.clone(), *slot));
            applied.starts.push((task.id.clone(), None));
            tx.create_task(task)?;
        }

        for old in plan.recreate {
            let wait_stop = may_be_running(&old).then(|| old.id.clone());
            let replacement = Task::new_for_slot(&service, old.slot);
            info!(
                slot = old.slot,
                old = %old.id,
                replacement = %replacement.id,
                "recreating task with current template"
            );

            applied.resets.push(SlotKey::of(&old));
            applied.cancels.push(old.id.clone());
            applied.starts.push((replacement.id.clone(), wait_stop));

            // Never picked up by an agent, so no terminal status would ever let it be reaped.
            if old.status.state == TaskState::New {
                tx.delete_task(&old.id)?;
            } else if old.desired_state < TaskState::Shutdown {
                let mut old = old;
                old.desired_state = TaskState::Shutdown;
                tx.update_task(old)?;
            }
            tx.create_task(replacement)?;
        }

        for task in plan.remove {
            debug!(slot = task.slot, task = %task.id, "removing excess task");
            applied.resets.push(SlotKey::of(&task));
            applied.cancels.push(task.id.clone());
            remove_task(tx, task)?;
        }

        for id in &plan.reap {
            tx.delete_task(id)?;
        }
        if !plan.reap.is_empty() {
            debug!(count = plan.reap.len(), "reaped tasks");
        }

        Ok(applied)
    }

    /// Takes down every task of a deleted service inside `tx`.
    #[instrument(level = "debug", skip_all, fields(service = %service_id))]
    pub fn remove_service_tasks(
        &self,
        tx: &mut Tx<'_>,
        service_id: &ServiceId,
    ) -> Result<Applied, CoreError> {
        let mut applied = Applied::default();
        if tx.get_service(service_id).is_some() {
            return Ok(applied);
        }

        for task in tx.tasks_by_service(service_id) {
            applied.cancels.push(task.id.clone());
            remove_task(tx, task)?;
        }
        applied.forget.push(service_id.clone());

        info!(tasks = applied.cancels.len(), "removed tasks of deleted service");
        Ok(applied)
    }

    /// Deletes a task marked for removal once its status is terminal.
    pub fn reap_task(&self, tx: &mut Tx<'_>, id: &TaskId) -> Result<bool, CoreError> {
        let Some(task) = tx.get_task(id) else {
            return Ok(false);
        };
        if task.desired_state != TaskState::Remove || !task.status.state.is_terminal() {
            return Ok(false);
        }
        tx.delete_task(id)?;
        Ok(true)
    }
}

fn remove_task(tx: &mut Tx<'_>, mut task: Task) -> Result<(), CoreError> {
    if deletable(&task) {
        tx.delete_task(&task.id)?;
    } else if task.desired_state != TaskState::Remove {
        task.desired_state = TaskState::Remove;
        tx.update_task(task)?;
    }
    Ok(())
}
