mod restart;
pub use restart::{BackoffPolicy, DEFAULT_RESTART_DELAY, RestartCondition, RestartPolicy};

mod task;
pub use task::{RuntimeSpec, TaskSpec};
