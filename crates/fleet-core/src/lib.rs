//! Restart supervision and replica reconciliation for replicated services.
//!
//! [`Orchestrator`] watches a [`fleet_store::MemoryStore`] and keeps every service at its
//! replica count: it fills and empties slots, recreates tasks whose template went stale and
//! replaces terminated tasks according to their [`fleet_model::RestartPolicy`].

mod config;
pub use config::OrchestratorConfig;

mod error;
pub use error::CoreError;

pub mod reconciler;
pub mod restart;
pub mod scheduler;

mod orchestrator;
pub use orchestrator::Orchestrator;
