//! Management API Routes

use super::{
    auth::{auth_middleware, ApiAuth},
    handlers::*,
    types::ApiAuthConfig,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Management API router
pub struct ManagementApi;

impl ManagementApi {
    /// Create the management API router
    pub fn create_router(state: AppState, auth_config: ApiAuthConfig) -> Router {
        let auth = Arc::new(ApiAuth::new(auth_config));

        // Read-only routes
        let public_routes = Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(export_metrics));

        // Mutating routes
        let protected_routes = Router::new()
            .route("/secrets", post(load_secrets))
            .route("/reset", post(reset))
            .layer(middleware::from_fn_with_state(auth, auth_middleware));

        Router::new()
            .merge(public_routes)
            .merge(protected_routes)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopPolicy;
    use crate::server::PortOrchestrator;
    use crate::service::{PreambleMatcher, ServiceContext};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        let ctx = ServiceContext::new(Arc::new(PreambleMatcher));
        let orchestrator = Arc::new(PortOrchestrator::new(
            ctx,
            "127.0.0.1".parse().unwrap(),
            StopPolicy::Drain,
        ));
        AppState::new(orchestrator, std::env::temp_dir().join("portmux-api-test.yml"))
            .with_restart_hook(Arc::new(|| {}))
    }

    fn protected() -> ApiAuthConfig {
        ApiAuthConfig {
            enabled: true,
            api_key: Some("test-key".to_string()),
            basic_auth: None,
        }
    }

    #[tokio::test]
    async fn test_public_health_endpoint() {
        let app = ManagementApi::create_router(create_test_state(), protected());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_endpoint_without_auth() {
        let app = ManagementApi::create_router(create_test_state(), protected());

        let request = Request::builder()
            .method("POST")
            .uri("/secrets")
            .body(Body::from(r#"{"keys":[]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reset_with_auth_runs_hook() {
        let restarted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&restarted);
        let state = create_test_state().with_restart_hook(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        let app = ManagementApi::create_router(state, protected());

        let request = Request::builder()
            .method("POST")
            .uri("/reset")
            .header("x-api-key", "test-key")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // The hook fires only after the response went out.
        assert!(!restarted.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(restarted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_metrics_not_configured() {
        let app = ManagementApi::create_router(create_test_state(), ApiAuthConfig::default());

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
