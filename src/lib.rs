//! portmux
//!
//! Multi-tenant, multi-port proxy server library. Access keys are grouped by
//! port; each port runs one TCP listener and one UDP socket, and the set of
//! bound ports converges on the current access-key configuration without
//! dropping connections on ports that stay.

pub mod config;
pub mod error;
pub mod management;
pub mod metrics;
pub mod net;
pub mod server;
pub mod service;
pub mod shutdown;

pub use config::Config;
pub use server::PortOrchestrator;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the proxy server
pub type Result<T> = anyhow::Result<T>;
