mod ids;
pub use ids::{ServiceId, TaskId};

mod meta;
pub use meta::{Meta, Version};

mod task_state;
pub use task_state::TaskState;

mod task_status;
pub use task_status::TaskStatus;

/// Logical instance index of a service.
///
/// A slot survives task recreation: the replacement task gets a new [`TaskId`]
/// but keeps the slot of the task it replaces. Slots are numbered from 1.
pub type Slot = u64;
