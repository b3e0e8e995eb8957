//! Management API Handlers

use super::types::*;
use crate::config::ConfigManager;
use crate::error::ReloadError;
use crate::metrics::PrometheusMetrics;
use crate::server::PortOrchestrator;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Invoked by `POST /reset` once the response has been sent.
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PortOrchestrator>,
    pub metrics: Option<Arc<PrometheusMetrics>>,
    /// Where accepted configurations are persisted.
    pub config_path: PathBuf,
    /// Keeps apply-then-persist of concurrent reloads in order.
    pub reload_lock: Arc<Mutex<()>>,
    pub restart: RestartHook,
    pub restart_delay: Duration,
    pub start_time: SystemTime,
}

impl AppState {
    pub fn new(orchestrator: Arc<PortOrchestrator>, config_path: PathBuf) -> Self {
        Self {
            orchestrator,
            metrics: None,
            config_path,
            reload_lock: Arc::new(Mutex::new(())),
            // A supervisor is expected to bring the process back.
            restart: Arc::new(|| {
                std::process::exit(1);
            }),
            restart_delay: RESTART_DELAY,
            start_time: SystemTime::now(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_restart_hook(mut self, restart: RestartHook) -> Self {
        self.restart = restart;
        self
    }
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let uptime_seconds = SystemTime::now()
        .duration_since(state.start_time)
        .unwrap_or_default()
        .as_secs();

    Json(ApiResponse::success(HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        ports: state.orchestrator.ports().await,
    }))
}

/// Prometheus text exposition
pub async fn export_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            metrics.export(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Apply a JSON access-key configuration and persist it as YAML.
pub async fn load_secrets(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse<SecretsLoaded>>) {
    info!("Updating config");

    let config = match ConfigManager::parse_json(&body) {
        Ok(config) => config,
        Err(e) => {
            error!("Rejected access keys: {}", e);
            return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string())));
        }
    };

    let _guard = state.reload_lock.lock().await;
    let summary = match state.orchestrator.reconcile(&config).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Failed to apply access keys: {}", e);
            let status = match e {
                ReloadError::Config(_) => StatusCode::BAD_REQUEST,
                ReloadError::Reconcile(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, Json(ApiResponse::error(e.to_string())));
        }
    };

    if let Err(e) = ConfigManager::save_to_file(&state.config_path, &config) {
        error!("Failed to persist access keys: {:#}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("{:#}", e))),
        );
    }

    (StatusCode::OK, Json(ApiResponse::success(SecretsLoaded::from(summary))))
}

/// Acknowledge, then restart the process after a short delay.
pub async fn reset(State(state): State<AppState>) -> Json<ApiResponse<String>> {
    warn!("Restart requested through the admin API");
    let restart = Arc::clone(&state.restart);
    let delay = state.restart_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        info!("Server has been reset");
        restart();
    });
    Json(ApiResponse::success("ok".to_string()))
}
