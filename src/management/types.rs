//! Management API Types

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::server::ReconcileSummary;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: SystemTime,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: SystemTime::now(),
        }
    }
}

/// Result of `POST /secrets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsLoaded {
    pub message: String,
    pub access_keys: usize,
    pub ports: usize,
    pub started: Vec<u16>,
    pub stopped: Vec<u16>,
    pub updated: Vec<u16>,
}

impl From<ReconcileSummary> for SecretsLoaded {
    fn from(summary: ReconcileSummary) -> Self {
        Self {
            message: format!("Loaded {} access keys", summary.keys),
            access_keys: summary.keys,
            ports: summary.ports,
            started: summary.started,
            stopped: summary.stopped,
            updated: summary.updated,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub ports: Vec<u16>,
}

/// API authentication configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiAuthConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub basic_auth: Option<BasicAuthConfig>,
}

/// Basic authentication configuration
#[derive(Clone, Deserialize, Serialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthConfig")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
