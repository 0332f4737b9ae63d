/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Re-runs of a tick step that hit an optimistic-concurrency conflict before it is dropped.
    pub max_conflict_retries: u32,
    /// Superseded tasks kept per slot for inspection; older ones are deleted.
    pub task_history_limit: usize,
    /// Seed of the restart jitter source; `None` seeds from the OS.
    pub jitter_seed: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            task_history_limit: 5,
            jitter_seed: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn with_task_history_limit(mut self, limit: usize) -> Self {
        self.task_history_limit = limit;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}
