//! # Replica planning.
//!
//! Pure function from one service and its tasks to the changes that converge the service
//! toward `replicas` live slots running the current template.
//!
//! ```text
//! slots:   1      2      3      4          replicas = 2
//!          [cur]  [cur*] [cur]  -           (* = dirty)
//! plan:    keep   recreate remove
//! ```
//!
//! ## Rules
//! - A slot is occupied while any of its tasks has `desired_state != Remove`.
//! - Scale-down empties the highest-numbered occupied slots.
//! - Scale-up fills the lowest free slot numbers, starting at 1.
//! - The current task of a slot is the newest one still meant to run, else the newest one.
//! - Superseded terminal tasks beyond the history limit are reaped, oldest first.

use std::collections::BTreeMap;

use fleet_model::{Service, Slot, Task, TaskId, TaskState};

/// Changes needed by one service.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServicePlan {
    /// Free slots to fill with a new task.
    pub create: Vec<Slot>,
    /// Tasks of excess slots to take down.
    pub remove: Vec<Task>,
    /// Current tasks whose template is stale.
    pub recreate: Vec<Task>,
    /// Tasks to delete from the store.
    pub reap: Vec<TaskId>,
}

impl ServicePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.remove.is_empty()
            && self.recreate.is_empty()
            && self.reap.is_empty()
    }
}

/// Orders tasks of one slot from oldest to newest.
fn age_key(t: &Task) -> (std::time::SystemTime, u64) {
    (t.meta.created_at, t.meta.version)
}

fn current<'a>(tasks: &[&'a Task]) -> Option<&'a Task> {
    let live = tasks
        .iter()
        .copied()
        .filter(|t| t.desired_state <= TaskState::Running)
        .max_by_key(|t| age_key(t));
    live.or_else(|| {
        tasks
            .iter()
            .copied()
            .filter(|t| t.desired_state != TaskState::Remove)
            .max_by_key(|t| age_key(t))
    })
}

/// Plans `service` against `tasks`, keeping at most `history_limit` tasks per slot.
pub fn plan_service(service: &Service, tasks: &[Task], history_limit: usize) -> ServicePlan {
    let mut plan = ServicePlan::default();

    let mut slots: BTreeMap<Slot, Vec<&Task>> = BTreeMap::new();
    for t in tasks.iter().filter(|t| t.service_id == service.id) {
        slots.entry(t.slot).or_default().push(t);
    }

    for t in slots.values().flatten() {
        if t.desired_state == TaskState::Remove && t.status.state.is_terminal() {
            plan.reap.push(t.id.clone());
        }
    }

    let occupied: Vec<Slot> = slots
        .iter()
        .filter(|(_, ts)| ts.iter().any(|t| t.desired_state != TaskState::Remove))
        .map(|(slot, _)| *slot)
        .collect();

    let replicas = usize::try_from(service.spec.replicas).unwrap_or(usize::MAX);
    let (keep, excess) = occupied.split_at(occupied.len().min(replicas));

    for slot in excess {
        plan.remove.extend(
            slots[slot]
                .iter()
                .filter(|t| t.desired_state != TaskState::Remove)
                .map(|t| (*t).clone()),
        );
    }

    let mut missing = replicas.saturating_sub(keep.len());
    let mut candidate: Slot = 1;
    while missing > 0 {
        if !occupied.contains(&candidate) {
            plan.create.push(candidate);
            missing -= 1;
        }
        candidate += 1;
    }

    let limit = history_limit.max(1);
    for slot in keep {
        let ts = &slots[slot];
        let Some(cur) = current(ts) else {
            continue;
        };
        if cur.is_dirty(service) {
            plan.recreate.push(cur.clone());
        }

        let mut superseded: Vec<&Task> = ts
            .iter()
            .copied()
            .filter(|t| {
                t.id != cur.id
                    && t.desired_state > TaskState::Running
                    && t.desired_state != TaskState::Remove
                    && t.status.state.is_terminal()
            })
            .collect();
        if ts.len() > limit {
            superseded.sort_by_key(|t| age_key(t));
            let surplus = (ts.len() - limit).min(superseded.len());
            plan.reap
                .extend(superseded.into_iter().take(surplus).map(|t| t.id.clone()));
        }
    }

    plan
}
