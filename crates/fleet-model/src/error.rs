use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("service name must not be empty")]
    EmptyName,
    #[error("backoff base {base:?} exceeds max {max:?}")]
    BackoffBaseExceedsMax {
        base: std::time::Duration,
        max: std::time::Duration,
    },
}
