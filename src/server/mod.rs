//! Port Lifecycle
//!
//! Port bindings and the orchestrator that starts, stops and updates them.

pub mod binding;
pub mod orchestrator;

pub use binding::PortBinding;
pub use orchestrator::{PortOrchestrator, ReconcileSummary, ServerState};
