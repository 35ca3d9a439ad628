//! HTTPS listener: request/response message ingress plus the certificate
//! bootstrap surface.
//!
//! TLS is terminated here with the hub trust domain; client certificates
//! are requested but not required, because nodes enrolling for their first
//! certificate have none to present. The peer identity (when present) is
//! injected into the router per connection, so the message-ingress handler
//! can run the same authorization gate as the long-lived transports.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use fleethub_core::{EdgeMessage, NodeId};

use crate::crypto::{extract_node_name_from_cert, hash_token};
use crate::router::RouterError;
use crate::state::AppState;
use crate::transport::TransportError;

/// Certificate-derived identity of the HTTPS peer, if it presented one.
#[derive(Clone)]
pub struct PeerIdentity(pub Option<NodeId>);

#[derive(Deserialize)]
pub struct SignRequest {
    pub bootstrap_token: String,
    pub csr: String,
}

#[derive(Serialize)]
pub struct SignResponse {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert: String,
    pub expires_at: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct QueuedResponse {
    pub queued: bool,
    pub message_id: String,
}

/// Bind the HTTPS listener and serve until shutdown.
pub async fn run_listener(
    state: Arc<AppState>,
    tls: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let addr = format!("{}:{}", state.config.https.address, state.config.https.port);
    let listener = TcpListener::bind(&addr).await.map_err(TransportError::Bind)?;
    let acceptor = TlsAcceptor::from(tls);
    let router = app_router(state);

    info!(addr = %addr, "HTTPS listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(acceptor, router, stream).await {
                        debug!(peer = %peer, error = %e, "HTTPS connection ended with error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("HTTPS listener stopping");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    router: Router,
    stream: TcpStream,
) -> Result<(), TransportError> {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "TLS handshake failed");
            return Ok(());
        }
    };

    let identity = {
        let (_, connection) = tls_stream.get_ref();
        connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|leaf| extract_node_name_from_cert(leaf.as_ref()).ok())
            .map(NodeId::new)
    };

    let router = router.layer(Extension(PeerIdentity(identity)));
    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        router.clone().oneshot(request)
    });

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(())
}

/// Routes served on the HTTPS port.
fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(post_message))
        .route("/ca.crt", get(get_ca_cert))
        .route("/certs/sign", post(sign_certificate))
        .with_state(state)
}

/// Message ingress for certificate-bearing callers.
///
/// Queued work is acknowledged with 202; terminal results for HTTPS-ingested
/// messages are delivered over the node's live session on another transport
/// when it has one, and otherwise only logged.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Extension(PeerIdentity(identity)): Extension<PeerIdentity>,
    Json(message): Json<EdgeMessage>,
) -> impl IntoResponse {
    let Some(cert_identity) = identity else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "client certificate required".to_string(),
            }),
        )
            .into_response();
    };

    let decision = state.gate.evaluate(&cert_identity, &message.node);
    if !decision.is_allowed() {
        state.metrics.auth_denied.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "authorization denied".to_string(),
            }),
        )
            .into_response();
    }

    state.registry.touch(&message.node).await;

    let message_id = message.id.to_string();
    match state.router.route(message).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(QueuedResponse {
                queued: true,
                message_id,
            }),
        )
            .into_response(),
        Err(RouterError::UnknownOpKind(op)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown operation kind: {op}"),
            }),
        )
            .into_response(),
        Err(RouterError::Dispatch(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// CA certificate for node bootstrap.
async fn get_ca_cert(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.ca {
        Some(ca) => (StatusCode::OK, ca.ca_cert_pem().to_string()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "certificate authority not configured".to_string(),
            }),
        )
            .into_response(),
    }
}

/// Edge certificate issuance.
///
/// Validates the bootstrap token, signs the CSR, and returns the node
/// certificate.
async fn sign_certificate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignRequest>,
) -> impl IntoResponse {
    let ca = match &state.ca {
        Some(ca) => ca,
        None => {
            warn!("Certificate signing requested but CA is not configured");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "certificate authority not configured".to_string(),
                }),
            )
                .into_response();
        }
    };

    let token_hash = hash_token(&req.bootstrap_token);
    let token_valid = {
        let mut tokens = state.bootstrap_tokens.write().await;
        if let Some(token) = tokens.get_mut(&token_hash) {
            if token.is_valid() {
                token.consume();
                info!(token_hash = %token_hash, "Bootstrap token consumed");
                true
            } else {
                warn!(token_hash = %token_hash, consumed = token.consumed, "Invalid or expired token");
                false
            }
        } else {
            warn!("Unknown bootstrap token attempted");
            false
        }
    };

    if !token_valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "invalid or expired bootstrap token".to_string(),
            }),
        )
            .into_response();
    }

    match ca.sign_csr(&req.csr) {
        Ok(signed) => {
            info!(
                node = %signed.node_name,
                expires_at = %signed.expires_at,
                "Edge certificate issued"
            );
            (
                StatusCode::OK,
                Json(SignResponse {
                    cert_pem: signed.cert_pem,
                    key_pem: signed.key_pem,
                    ca_cert: ca.ca_cert_pem().to_string(),
                    expires_at: signed.expires_at.to_rfc3339(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to sign CSR");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("failed to sign CSR: {}", e),
                }),
            )
                .into_response()
        }
    }
}
