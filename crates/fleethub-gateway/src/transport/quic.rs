//! QUIC listener: quinn endpoint with a per-connection incoming-stream
//! ceiling.
//!
//! The first bidirectional stream a peer opens is the session control
//! stream; outbound frames travel on it. Additional incoming streams carry
//! further inbound messages for the same session, up to the configured
//! ceiling, which quinn enforces at the transport level.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, Endpoint, RecvStream, VarInt};
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleethub_core::{Frame, NodeId, TransportKind};

use crate::crypto::{cert_fingerprint, extract_node_name_from_cert};
use crate::state::AppState;
use crate::transport::{
    read_frame, write_frame, AdmitError, Control, SessionPump, TransportError, SESSION_SEND_BUFFER,
};

/// Bind the QUIC endpoint and accept sessions until shutdown.
pub async fn run_listener(
    state: Arc<AppState>,
    tls: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let addr: SocketAddr = format!("{}:{}", state.config.quic.address, state.config.quic.port)
        .parse()
        .map_err(|e| TransportError::Tls(format!("invalid quic address: {e}")))?;

    let crypto = QuicServerConfig::try_from(tls.as_ref().clone())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(VarInt::from_u32(state.config.quic.max_incoming_streams));
    server_config.transport_config(Arc::new(transport));

    let endpoint = Endpoint::server(server_config, addr).map_err(TransportError::Bind)?;

    info!(
        addr = %addr,
        max_streams = state.config.quic.max_incoming_streams,
        "QUIC listener started"
    );

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    return Ok(());
                };
                let state = state.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            if let Err(e) = handle_connection(state, connection).await {
                                debug!(error = %e, "QUIC connection ended with error");
                            }
                        }
                        Err(e) => warn!(error = %e, "QUIC handshake failed"),
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("QUIC listener stopping");
                endpoint.close(VarInt::from_u32(0), b"shutdown");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    state: Arc<AppState>,
    connection: Connection,
) -> Result<(), TransportError> {
    let (identity, fingerprint) = match peer_identity(&connection) {
        Some(pair) => pair,
        None => {
            warn!("QUIC peer presented no usable certificate identity");
            connection.close(VarInt::from_u32(1), b"no identity");
            return Ok(());
        }
    };

    // The peer opens the control stream first.
    let (mut control_send, control_recv) = match connection.accept_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(node = %identity, error = %e, "No control stream");
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::channel::<Frame>(SESSION_SEND_BUFFER);
    let pump = match SessionPump::admit(
        state,
        identity.clone(),
        identity.clone(),
        TransportKind::Quic,
        fingerprint,
        tx,
    )
    .await
    {
        Ok(pump) => Arc::new(pump),
        Err(e) => {
            let reason = match &e {
                AdmitError::Registry(r) => r.to_string(),
                AdmitError::AuthorizationDenied(_) => "authorization denied".to_string(),
            };
            warn!(node = %identity, reason = %reason, "Session refused");
            let _ = write_frame(&mut control_send, &Frame::Close { reason }).await;
            connection.close(VarInt::from_u32(2), b"refused");
            return Ok(());
        }
    };

    // Inbound frames from the control stream; `ingress_done` fires when the
    // peer's control stream ends.
    let ingress_done = CancellationToken::new();
    tokio::spawn(run_ingress(
        pump.clone(),
        control_recv,
        ingress_done.clone(),
    ));

    loop {
        tokio::select! {
            _ = pump.cancelled() => {
                let _ = write_frame(
                    &mut control_send,
                    &Frame::Close { reason: "session closed".to_string() },
                )
                .await;
                connection.close(VarInt::from_u32(0), b"closed");
                break;
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if write_frame(&mut control_send, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Additional incoming streams multiplex more inbound messages.
            stream = connection.accept_bi() => {
                match stream {
                    Ok((extra_send, extra_recv)) => {
                        drop(extra_send);
                        tokio::spawn(run_ingress(
                            pump.clone(),
                            extra_recv,
                            CancellationToken::new(),
                        ));
                    }
                    Err(_) => break,
                }
            }
            _ = ingress_done.cancelled() => break,
        }
    }

    pump.finish().await;
    Ok(())
}

/// Pump inbound frames from one receive stream into the session. Cancels
/// `done` on exit so the connection task can observe stream end.
async fn run_ingress(pump: Arc<SessionPump>, mut recv: RecvStream, done: CancellationToken) {
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(frame)) => {
                if pump.handle_frame(frame).await == Control::Close {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(node = %pump.node(), error = %e, "QUIC stream read error");
                break;
            }
        }
    }
    done.cancel();
}

/// Identity and fingerprint from the QUIC peer certificate.
fn peer_identity(connection: &Connection) -> Option<(NodeId, String)> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    let leaf = certs.first()?;
    let name = extract_node_name_from_cert(leaf.as_ref()).ok()?;
    Some((NodeId::new(name), cert_fingerprint(leaf.as_ref())))
}
