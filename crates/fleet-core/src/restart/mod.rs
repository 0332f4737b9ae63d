mod delay;
pub use delay::{Jitter, RestartDelay, task_restart_delay};

mod history;
pub use history::{RestartHistory, SlotKey};

mod supervisor;
pub use supervisor::{PlannedRestart, RestartDecision, RestartSupervisor, TerminateReason};
