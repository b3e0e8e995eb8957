//! Management API Module
//!
//! HTTP control surface: access-key reload, restart, health and metrics.

pub mod api;
pub mod auth;
pub mod handlers;
pub mod server;
pub mod types;

pub use api::ManagementApi;
pub use auth::ApiAuth;
pub use handlers::{AppState, RestartHook};
pub use server::ManagementServer;
pub use types::*;
