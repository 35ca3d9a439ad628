//! Monitor server: health, Prometheus metrics, and session introspection.
//!
//! Plain HTTP, bound to loopback by default; this surface is for operators,
//! not edge nodes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::metrics::collect_metrics;
use crate::state::AppState;
use crate::transport::TransportError;

#[derive(Serialize)]
struct SessionView {
    node: String,
    session_id: String,
    transport: String,
    cert_fingerprint: String,
    connected_at: String,
    last_keepalive: String,
}

#[derive(Serialize)]
struct SessionsResponse {
    count: usize,
    limit: usize,
    sessions: Vec<SessionView>,
}

/// Create the monitor router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/sessions", get(list_sessions))
        .layer(cors)
        .with_state(state)
}

/// Serve the monitor router until shutdown.
pub async fn run_server(
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let addr = state.config.monitor.bind_address.clone();
    let listener = TcpListener::bind(&addr).await.map_err(TransportError::Bind)?;
    let router = create_router(state);

    info!(addr = %addr, "Monitor server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let output = collect_metrics(&state.registry, &state.metrics).await;
    (StatusCode::OK, output)
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<SessionView> = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|s| SessionView {
            node: s.node.to_string(),
            session_id: s.session_id.to_string(),
            transport: s.transport.to_string(),
            cert_fingerprint: s.cert_fingerprint,
            connected_at: s.connected_at.to_rfc3339(),
            last_keepalive: s.last_keepalive.to_rfc3339(),
        })
        .collect();

    Json(SessionsResponse {
        count: sessions.len(),
        limit: state.registry.node_limit(),
        sessions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::upstream::InMemoryCluster;
    use axum::body::Body;
    use axum::http::Request;
    use fleethub_core::{Frame, NodeId, TransportKind};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        AppState::new(Config::default(), InMemoryCluster::new(), None)
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sessions_listing_reflects_registry() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel::<Frame>(4);
        state
            .registry
            .admit(
                NodeId::new("edge-1"),
                TransportKind::WebSocket,
                "ab12".to_string(),
                tx,
            )
            .await
            .unwrap();

        let router = create_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["limit"], 1000);
        assert_eq!(body["sessions"][0]["node"], "edge-1");
        assert_eq!(body["sessions"][0]["transport"], "websocket");
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("fleethub_sessions_total 0"));
    }
}
