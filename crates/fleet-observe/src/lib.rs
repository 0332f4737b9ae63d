//! Logger bootstrap for processes hosting the fleet orchestrator.

mod logger;
pub use logger::*;
