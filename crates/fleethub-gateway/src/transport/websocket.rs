//! WebSocket listener: TLS-terminated, certificate-authenticated sessions.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleethub_core::{Frame, NodeId, TransportKind};

use crate::crypto::{cert_fingerprint, extract_node_name_from_cert};
use crate::state::AppState;
use crate::transport::{AdmitError, Control, SessionPump, TransportError, SESSION_SEND_BUFFER};

/// Bind the WebSocket listener and accept sessions until shutdown.
pub async fn run_listener(
    state: Arc<AppState>,
    tls: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let addr = format!(
        "{}:{}",
        state.config.websocket.address, state.config.websocket.port
    );
    let listener = TcpListener::bind(&addr).await.map_err(TransportError::Bind)?;
    let acceptor = TlsAcceptor::from(tls);

    info!(addr = %addr, "WebSocket listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, acceptor, stream).await {
                        debug!(peer = %peer, error = %e, "WebSocket connection ended with error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("WebSocket listener stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    state: Arc<AppState>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
) -> Result<(), TransportError> {
    // Handshake failures never become sessions.
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "TLS handshake failed");
            return Ok(());
        }
    };

    let (identity, fingerprint) = match peer_identity(&tls_stream) {
        Some(pair) => pair,
        None => {
            warn!("Peer presented no usable certificate identity");
            return Ok(());
        }
    };

    let ws = match tokio_tungstenite::accept_async(tls_stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(node = %identity, error = %e, "WebSocket upgrade failed");
            return Ok(());
        }
    };
    let (mut sink, mut reader) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Frame>(SESSION_SEND_BUFFER);
    let pump = match SessionPump::admit(
        state,
        identity.clone(),
        identity.clone(),
        TransportKind::WebSocket,
        fingerprint,
        tx,
    )
    .await
    {
        Ok(pump) => pump,
        Err(e) => {
            // Refuse with a distinguishable close so the edge can back off.
            let reason = match &e {
                AdmitError::Registry(r) => r.to_string(),
                AdmitError::AuthorizationDenied(_) => "authorization denied".to_string(),
            };
            warn!(node = %identity, reason = %reason, "Session refused");
            let close = Frame::Close { reason };
            if let Ok(text) = close.to_json() {
                let _ = sink.send(Message::Text(text)).await;
            }
            let _ = sink.close().await;
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            _ = pump.cancelled() => {
                // Drain the close frame the registry queued, then hang up.
                while let Ok(frame) = rx.try_recv() {
                    if let Ok(text) = frame.to_json() {
                        let _ = sink.send(Message::Text(text)).await;
                    }
                }
                let _ = sink.close().await;
                break;
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let text = frame.to_json()?;
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match Frame::from_json(&text) {
                            Ok(frame) => {
                                if pump.handle_frame(frame).await == Control::Close {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(node = %pump.node(), error = %e, "Undecodable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        match Frame::decode_body(&bytes) {
                            Ok(frame) => {
                                if pump.handle_frame(frame).await == Control::Close {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(node = %pump.node(), error = %e, "Undecodable binary frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        pump.handle_frame(Frame::Keepalive { node: pump.node().clone() }).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pump.handle_frame(Frame::Keepalive { node: pump.node().clone() }).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(node = %pump.node(), error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
        }
    }

    pump.finish().await;
    Ok(())
}

/// Identity and fingerprint from the TLS peer certificate.
fn peer_identity(
    tls_stream: &tokio_rustls::server::TlsStream<TcpStream>,
) -> Option<(NodeId, String)> {
    let (_, connection) = tls_stream.get_ref();
    let certs = connection.peer_certificates()?;
    let leaf = certs.first()?;
    let name = extract_node_name_from_cert(leaf.as_ref()).ok()?;
    Some((NodeId::new(name), cert_fingerprint(leaf.as_ref())))
}
