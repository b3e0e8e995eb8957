//! Error Types
//!
//! Typed failures for the port lifecycle, configuration parsing, relaying and
//! socket marking. Application plumbing wraps these in `anyhow`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Creating the listening sockets for a port failed.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to start TCP on port {port}: {source}")]
    Tcp {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to start UDP on port {port}: {source}")]
    Udp {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Stopping a port binding failed.
#[derive(Debug, Error)]
pub enum StopError {
    #[error("port {0} is not bound")]
    NotBound(u16),

    /// One or both service loops ended abnormally. Every failure is listed.
    #[error("failed to stop port {port}: {}", .failures.join("; "))]
    Loops { port: u16, failures: Vec<String> },
}

/// Why a single port could not be converged.
#[derive(Debug, Error)]
pub enum PortFailure {
    #[error(transparent)]
    Start(#[from] BindError),

    #[error(transparent)]
    Stop(#[from] StopError),
}

/// Aggregate of every per-port failure in one reconcile pass.
///
/// Changes applied to other ports during the same pass stay in effect.
#[derive(Debug, Error)]
pub struct ReconcileError {
    pub failures: Vec<(u16, PortFailure)>,
}

impl ReconcileError {
    /// Ports that failed to start or stop, in ascending order.
    pub fn failed_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.failures.iter().map(|(port, _)| *port).collect();
        ports.sort_unstable();
        ports
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reconcile failed on {} port(s)", self.failures.len())?;
        for (port, failure) in &self.failures {
            write!(f, "; port {}: {}", port, failure)?;
        }
        Ok(())
    }
}

/// Applying a configuration failed.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The configuration was rejected before any port was touched.
    #[error(transparent)]
    Config(#[from] ConfigParseError),

    /// Some ports could not be converged. Other changes were applied.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Malformed or invalid access-key configuration. The reload is rejected.
#[derive(Debug, Error)]
pub enum ConfigParseError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to create cipher for key {id}: unsupported cipher '{cipher}'")]
    UnknownCipher { id: String, cipher: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which half of a relay failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// First connection towards the second.
    Forward,
    /// Second connection towards the first.
    Reverse,
}

impl fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayDirection::Forward => f.write_str("forward"),
            RelayDirection::Reverse => f.write_str("reverse"),
        }
    }
}

/// I/O failure while relaying. Terminates only the affected connection.
#[derive(Debug, Error)]
#[error("{direction} relay failed: {source}")]
pub struct RelayError {
    pub direction: RelayDirection,
    #[source]
    pub source: io::Error,
}

/// Best-effort socket tagging failed. Logged, never propagated to the connection.
#[derive(Debug, Error)]
pub enum MarkingError {
    #[error("failed to set SO_MARK {mark:#010x}: {source}")]
    SetMark {
        mark: u32,
        #[source]
        source: io::Error,
    },

    #[error("socket marking is not supported on this platform")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_error_names_every_port() {
        let err = ReconcileError {
            failures: vec![
                (
                    9000,
                    PortFailure::Start(BindError::Tcp {
                        port: 9000,
                        source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
                    }),
                ),
                (8000, PortFailure::Stop(StopError::NotBound(8000))),
            ],
        };

        let message = err.to_string();
        assert!(message.contains("2 port(s)"));
        assert!(message.contains("port 9000"));
        assert!(message.contains("port 8000 is not bound"));
        assert_eq!(err.failed_ports(), vec![8000, 9000]);
    }

    #[test]
    fn test_stop_error_lists_failures() {
        let err = StopError::Loops {
            port: 443,
            failures: vec!["tcp loop panicked".to_string(), "udp loop panicked".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "failed to stop port 443: tcp loop panicked; udp loop panicked"
        );
    }
}
