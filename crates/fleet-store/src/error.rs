use thiserror::Error;

use fleet_model::ModelError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("update out of sequence for {id}: expected version {expected}, found {found}")]
    SequenceConflict { id: String, expected: u64, found: u64 },
    #[error("invalid service spec: {0}")]
    InvalidSpec(#[from] ModelError),
    #[error("watch fell behind by {0} events")]
    WatchLagged(u64),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Returns `true` for optimistic-concurrency failures that succeed after a re-read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::SequenceConflict { .. })
    }
}
