use serde::{Deserialize, Serialize};

use crate::{Meta, Service, ServiceId, Slot, TaskId, TaskSpec, TaskState, TaskStatus, Version};

/// One instance of a service's workload, bound to a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub service_id: ServiceId,
    /// Service name at creation time, for observers.
    pub service_name: String,
    pub slot: Slot,
    /// Snapshot of the service template; never modified after creation.
    pub spec: TaskSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<Version>,
    pub status: TaskStatus,
    pub desired_state: TaskState,
    #[serde(default)]
    pub meta: Meta,
}

impl Task {
    /// Builds a fresh task for `slot` from the service's current template.
    ///
    /// The task starts in `New` with `desired_state = Ready`: placement may proceed,
    /// but it must not run until something moves it to `Running`.
    pub fn new_for_slot(service: &Service, slot: Slot) -> Self {
        Self {
            id: TaskId::generate(),
            service_id: service.id.clone(),
            service_name: service.spec.name.clone(),
            slot,
            spec: service.spec.task.clone(),
            spec_version: service.spec_version,
            status: TaskStatus::new(TaskState::New),
            desired_state: TaskState::Ready,
            meta: Meta::default(),
        }
    }

    /// Returns `true` if the task was created from a template other than the service's current one.
    pub fn is_dirty(&self, service: &Service) -> bool {
        self.spec != service.spec.task || self.spec_version != service.spec_version
    }
}
