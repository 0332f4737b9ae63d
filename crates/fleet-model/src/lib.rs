//! Data model shared by the fleet store and orchestrator.
//!
//! A [`Service`] declares a task template and a replica count; the orchestrator keeps one
//! [`Task`] alive per [`Slot`]. Tasks snapshot the template at creation and never change it.

mod domain;
pub use domain::*;

mod kind;
pub use kind::*;

mod error;
pub use error::ModelError;

mod service;
pub use service::{Service, ServiceSpec};

mod task;
pub use task::Task;
