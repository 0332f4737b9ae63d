//! # Per-slot restart bookkeeping.
//!
//! History is keyed by [`SlotKey`] rather than task id: every restart produces a new task,
//! but the slot stays the same. Each entry remembers the spec version it was recorded for;
//! a lookup under another version sees an empty history.
//!
//! ```text
//! SlotKey(service, slot) ──► SlotHistory {
//!                               spec_version,
//!                               restarts: [t0, t1, ...]   (only with max_attempts > 0 and window > 0)
//!                               total_restarts,           (window = 0 accounting)
//!                               failures_since_success,   (backoff escalation)
//!                            }
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use fleet_model::{RestartPolicy, ServiceId, Slot, Task, Version};

/// Stable identity of "instance N of service S" across recreations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub service_id: ServiceId,
    pub slot: Slot,
}

impl SlotKey {
    pub fn new(service_id: ServiceId, slot: Slot) -> Self {
        Self { service_id, slot }
    }

    pub fn of(task: &Task) -> Self {
        Self::new(task.service_id.clone(), task.slot)
    }
}

#[derive(Debug, Default)]
struct SlotHistory {
    spec_version: Option<Version>,
    restarts: VecDeque<Instant>,
    total_restarts: u64,
    failures_since_success: u64,
}

impl SlotHistory {
    fn fresh(spec_version: Option<Version>) -> Self {
        Self {
            spec_version,
            ..Self::default()
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.restarts.front() {
            let expired = now
                .checked_duration_since(*front)
                .is_some_and(|age| age >= window);
            if !expired {
                break;
            }
            self.restarts.pop_front();
        }
    }
}

/// In-memory restart history of every slot the orchestrator has restarted.
///
/// Not persisted: an orchestrator restart starts from an empty history.
#[derive(Debug, Default)]
pub struct RestartHistory {
    slots: HashMap<SlotKey, SlotHistory>,
}

impl RestartHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self, key: &SlotKey, version: Option<Version>) -> Option<&SlotHistory> {
        self.slots
            .get(key)
            .filter(|h| h.spec_version == version)
    }

    /// Failures recorded since the slot was last observed running.
    pub fn failures_since_success(&self, key: &SlotKey, version: Option<Version>) -> u64 {
        self.current(key, version)
            .map_or(0, |h| h.failures_since_success)
    }

    /// Restarts that count toward `policy.max_attempts` at `now`.
    ///
    /// With a window, entries at least `window` old are pruned first.
    pub fn counted_restarts(
        &mut self,
        key: &SlotKey,
        version: Option<Version>,
        policy: &RestartPolicy,
        now: Instant,
    ) -> u64 {
        let Some(h) = self.slots.get_mut(key).filter(|h| h.spec_version == version) else {
            return 0;
        };
        if policy.window.is_zero() {
            return h.total_restarts;
        }
        h.prune(policy.window, now);
        h.restarts.len() as u64
    }

    /// Records a restart of the slot at `now`.
    pub fn record_failure(
        &mut self,
        key: SlotKey,
        version: Option<Version>,
        policy: &RestartPolicy,
        now: Instant,
    ) {
        let h = self
            .slots
            .entry(key)
            .or_insert_with(|| SlotHistory::fresh(version));
        if h.spec_version != version {
            *h = SlotHistory::fresh(version);
        }

        h.failures_since_success = h.failures_since_success.saturating_add(1);
        h.total_restarts = h.total_restarts.saturating_add(1);
        if policy.max_attempts > 0 && !policy.window.is_zero() {
            h.prune(policy.window, now);
            h.restarts.push_back(now);
        }
    }

    /// Clears the backoff escalation of a slot whose task reached `Running`.
    ///
    /// Attempt accounting for `max_attempts` is kept.
    pub fn record_success(&mut self, key: &SlotKey) {
        if let Some(h) = self.slots.get_mut(key) {
            h.failures_since_success = 0;
        }
    }

    /// Drops the slot's history entirely.
    pub fn reset(&mut self, key: &SlotKey) {
        self.slots.remove(key);
    }

    /// Drops the history of every slot of a service.
    pub fn forget_service(&mut self, service_id: &ServiceId) {
        self.slots.retain(|k, _| &k.service_id != service_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
