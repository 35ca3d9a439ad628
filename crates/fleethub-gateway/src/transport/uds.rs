//! Unix-domain-socket listener for local trusted callers.
//!
//! No network TLS here; the first frame must be a `Hello` carrying the
//! caller's PEM certificate, and identity flows through the same
//! certificate-derived path as the TLS transports.

use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleethub_core::{Frame, NodeId, TransportKind};

use crate::crypto::extract_node_name_from_pem;
use crate::state::AppState;
use crate::transport::{
    read_frame, write_frame, AdmitError, Control, SessionPump, TransportError, SESSION_SEND_BUFFER,
};

/// Bind the Unix-socket listener and accept sessions until shutdown.
pub async fn run_listener(
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let path = state.config.unix_socket.path.clone();

    // A previous run may have left the socket file behind.
    if Path::new(&path).exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&path).map_err(TransportError::Bind)?;
    info!(path = %path, "Unix socket listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream).await {
                        debug!(error = %e, "Unix socket connection ended with error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("Unix socket listener stopping");
                std::fs::remove_file(&path).ok();
                return Ok(());
            }
        }
    }
}

async fn handle_connection(state: Arc<AppState>, stream: UnixStream) -> Result<(), TransportError> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // The hello must arrive first and carry a parseable certificate.
    let hello = match read_frame(&mut reader).await? {
        Some(Frame::Hello(hello)) => hello,
        Some(_) => {
            warn!("Unix socket peer sent a non-hello first frame");
            let _ = write_frame(
                &mut writer,
                &Frame::Close {
                    reason: "hello expected".to_string(),
                },
            )
            .await;
            return Ok(());
        }
        None => return Ok(()),
    };

    let cert_identity = match extract_node_name_from_pem(&hello.cert_pem) {
        Ok(name) => NodeId::new(name),
        Err(e) => {
            warn!(error = %e, "Unix socket peer certificate rejected");
            let _ = write_frame(
                &mut writer,
                &Frame::Close {
                    reason: "certificate rejected".to_string(),
                },
            )
            .await;
            return Ok(());
        }
    };

    let fingerprint = ::pem::parse(&hello.cert_pem)
        .map(|p| crate::crypto::cert_fingerprint(p.contents()))
        .unwrap_or_default();

    let (tx, mut rx) = mpsc::channel::<Frame>(SESSION_SEND_BUFFER);
    let pump = match SessionPump::admit(
        state,
        cert_identity,
        hello.node.clone(),
        TransportKind::Unix,
        fingerprint,
        tx,
    )
    .await
    {
        Ok(pump) => pump,
        Err(e) => {
            let reason = match &e {
                AdmitError::Registry(r) => r.to_string(),
                AdmitError::AuthorizationDenied(_) => "authorization denied".to_string(),
            };
            warn!(node = %hello.node, reason = %reason, "Session refused");
            let _ = write_frame(&mut writer, &Frame::Close { reason }).await;
            return Ok(());
        }
    };

    // Writer task owns the socket's write half; it drains naturally once the
    // registry drops the session sender.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = pump.cancelled() => break,
            inbound = read_frame(&mut reader) => {
                match inbound {
                    Ok(Some(frame)) => {
                        if pump.handle_frame(frame).await == Control::Close {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(node = %pump.node(), error = %e, "Unix socket read error");
                        break;
                    }
                }
            }
        }
    }

    pump.finish().await;
    let _ = writer_task.await;
    Ok(())
}
