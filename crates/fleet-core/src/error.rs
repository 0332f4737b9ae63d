use thiserror::Error;

use fleet_store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("orchestrator is already running")]
    AlreadyRunning,
}

impl CoreError {
    /// Stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            CoreError::Store(e) if e.is_conflict() => "store_conflict",
            CoreError::Store(StoreError::WatchLagged(_)) => "store_watch_lagged",
            CoreError::Store(StoreError::Closed) => "store_closed",
            CoreError::Store(_) => "store_error",
            CoreError::Invariant(_) => "core_invariant",
            CoreError::AlreadyRunning => "core_already_running",
        }
    }

    /// Returns `true` if re-running the step against fresh state may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Store(e) if e.is_conflict())
    }
}
