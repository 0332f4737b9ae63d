use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// Used both for the observed `status.state` and for the `desired_state` the orchestrator
/// asks the runtime to reach. The order is significant: every state after
/// [`TaskState::Running`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Ready,
    Starting,
    Running,
    Completed,
    Failed,
    Rejected,
    Shutdown,
    Orphaned,
    Remove,
}

impl TaskState {
    /// Returns `true` if the task will not transition further on its own.
    pub fn is_terminal(&self) -> bool {
        *self > TaskState::Running
    }

    /// Short lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Ready => "ready",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Shutdown => "shutdown",
            TaskState::Orphaned => "orphaned",
            TaskState::Remove => "remove",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
