//! Transport listeners and the session pump they share.
//!
//! Each listener authenticates a peer, admits a session, then drives frames
//! through the same [`SessionPump`]: admission-time authorization, keepalive
//! touches, per-message identity re-checks, and routing with backpressure.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fleethub_core::{Ack, CoreError, Frame, NodeId, TransportKind, MAX_FRAME_LEN};

use crate::auth::Decision;
use crate::registry::{RegistryError, SessionHandle};
use crate::router::RouterError;
use crate::state::AppState;

pub mod https;
pub mod quic;
pub mod uds;
pub mod websocket;

/// Outbound frame buffer per session.
pub const SESSION_SEND_BUFFER: usize = 64;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error(transparent)]
    Frame(#[from] CoreError),
}

/// Why a connection was not admitted as a session.
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("authorization denied for node {0}")]
    AuthorizationDenied(NodeId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Close,
}

/// Per-session frame processing shared by every transport.
pub struct SessionPump {
    state: Arc<AppState>,
    handle: SessionHandle,
    cert_identity: NodeId,
}

impl std::fmt::Debug for SessionPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPump")
            .field("handle", &self.handle)
            .field("cert_identity", &self.cert_identity)
            .finish_non_exhaustive()
    }
}

impl SessionPump {
    /// Run admission for an authenticated connection: the authorization
    /// gate first, then the registry (ceiling + supersede).
    pub async fn admit(
        state: Arc<AppState>,
        cert_identity: NodeId,
        claimed: NodeId,
        transport: TransportKind,
        cert_fingerprint: String,
        tx: mpsc::Sender<Frame>,
    ) -> Result<Self, AdmitError> {
        let decision = state.gate.evaluate(&cert_identity, &claimed);
        if !decision.is_allowed() {
            state.metrics.auth_denied.fetch_add(1, Ordering::Relaxed);
            return Err(AdmitError::AuthorizationDenied(claimed));
        }

        let handle = state
            .registry
            .admit(claimed, transport, cert_fingerprint, tx)
            .await?;

        Ok(Self {
            state,
            handle,
            cert_identity,
        })
    }

    /// The session's cancellation signal; fires on supersede or eviction.
    pub async fn cancelled(&self) {
        self.handle.cancel.cancelled().await
    }

    /// Node this session belongs to.
    pub fn node(&self) -> &NodeId {
        &self.handle.node
    }

    /// Process one inbound frame.
    ///
    /// Any frame counts as a liveness signal. Routing awaits queue capacity,
    /// which is what pauses this connection's reads under backpressure.
    pub async fn handle_frame(&self, frame: Frame) -> Control {
        self.state.registry.touch(&self.handle.node).await;

        match frame {
            Frame::Keepalive { .. } => Control::Continue,
            Frame::Message(message) => {
                self.handle_message(message).await;
                Control::Continue
            }
            Frame::Ack(ack) => {
                debug!(node = %self.handle.node, ref_id = %ack.ref_id, "Push acknowledged by edge");
                Control::Continue
            }
            Frame::Close { reason } => {
                info!(node = %self.handle.node, reason = %reason, "Edge closed session");
                Control::Close
            }
            Frame::Hello(_) | Frame::Push { .. } => {
                debug!(node = %self.handle.node, "Ignoring unexpected frame");
                Control::Continue
            }
        }
    }

    async fn handle_message(&self, message: fleethub_core::EdgeMessage) {
        // Re-gate messages that claim a different identity than the session.
        if message.node != self.handle.node {
            let decision = self.state.gate.evaluate(&self.cert_identity, &message.node);
            if decision == Decision::Deny {
                self.state.metrics.auth_denied.fetch_add(1, Ordering::Relaxed);
                warn!(
                    node = %self.handle.node,
                    claimed = %message.node,
                    "Message-level authorization denied"
                );
                self.reply(Ack::failure(message.id, "authorization denied"))
                    .await;
                return;
            }
        }

        let message_id = message.id.clone();
        match self.state.router.route(message).await {
            Ok(()) => {}
            Err(RouterError::UnknownOpKind(op)) => {
                self.reply(Ack::failure(
                    message_id,
                    format!("unknown operation kind: {op}"),
                ))
                .await;
            }
            Err(RouterError::Dispatch(e)) => {
                self.reply(Ack::failure(message_id, e.to_string())).await;
            }
        }
    }

    /// Queue a reply ack on this session's outbound channel.
    async fn reply(&self, ack: Ack) {
        if let Err(e) = self
            .state
            .registry
            .send_to_node(&self.handle.node, Frame::Ack(ack))
            .await
        {
            debug!(node = %self.handle.node, error = %e, "Reply not delivered");
        }
    }

    /// Disconnect cleanup. Idempotent against supersede/eviction races.
    pub async fn finish(&self) {
        self.state
            .registry
            .remove(&self.handle.node, &self.handle.session_id)
            .await;
    }
}

/// Read one length-prefixed frame from a byte-stream transport.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Frame(CoreError::FrameTooLarge(
            len,
            MAX_FRAME_LEN,
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Frame::decode_body(&body)?))
}

/// Write one length-prefixed frame to a byte-stream transport.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthorizationConfig, Config};
    use crate::upstream::InMemoryCluster;
    use fleethub_core::{EdgeMessage, OpKind};
    use serde_json::json;

    fn state(auth_enabled: bool) -> Arc<AppState> {
        let config = Config {
            authorization: AuthorizationConfig {
                enable: auth_enabled,
                ..AuthorizationConfig::default()
            },
            ..Config::default()
        };
        AppState::new(config, InMemoryCluster::new(), None)
    }

    #[tokio::test]
    async fn test_admission_then_message_flow() {
        let state = state(true);
        let (tx, mut rx) = mpsc::channel(SESSION_SEND_BUFFER);

        let pump = SessionPump::admit(
            state.clone(),
            NodeId::new("edge-1"),
            NodeId::new("edge-1"),
            TransportKind::WebSocket,
            "fp".to_string(),
            tx,
        )
        .await
        .unwrap();

        let message = EdgeMessage::new(
            NodeId::new("edge-1"),
            OpKind::UpdateNodeStatus,
            json!({"ready": true}),
        );
        let id = message.id.clone();
        assert_eq!(pump.handle_frame(Frame::Message(message)).await, Control::Continue);

        // The worker acknowledges success on the session channel.
        match rx.recv().await {
            Some(Frame::Ack(ack)) => {
                assert_eq!(ack.ref_id, id);
                assert!(ack.success);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_message_identity_denied_session_survives() {
        let state = state(true);
        let (tx, mut rx) = mpsc::channel(SESSION_SEND_BUFFER);

        let pump = SessionPump::admit(
            state.clone(),
            NodeId::new("edge-1"),
            NodeId::new("edge-1"),
            TransportKind::WebSocket,
            "fp".to_string(),
            tx,
        )
        .await
        .unwrap();

        // Message claims edge-2 over edge-1's session: denied at message
        // level, and the connection is not torn down.
        let message = EdgeMessage::new(
            NodeId::new("edge-2"),
            OpKind::UpdateNodeStatus,
            json!({"ready": true}),
        );
        let id = message.id.clone();
        let control = pump.handle_frame(Frame::Message(message)).await;
        assert_eq!(control, Control::Continue);

        match rx.recv().await {
            Some(Frame::Ack(ack)) => {
                assert_eq!(ack.ref_id, id);
                assert!(!ack.success);
                assert!(ack.error.unwrap().contains("authorization denied"));
            }
            other => panic!("expected deny ack, got {:?}", other),
        }

        assert!(state.registry.is_live(pump.node(), &pump.handle.session_id).await);
        assert_eq!(state.metrics.auth_denied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_op_kind_gets_failure_ack() {
        let state = state(false);
        let (tx, mut rx) = mpsc::channel(SESSION_SEND_BUFFER);

        let pump = SessionPump::admit(
            state.clone(),
            NodeId::new("edge-1"),
            NodeId::new("edge-1"),
            TransportKind::Unix,
            String::new(),
            tx,
        )
        .await
        .unwrap();

        let mut message =
            EdgeMessage::new(NodeId::new("edge-1"), OpKind::CreateLease, json!({}));
        message.op = "bogus".to_string();
        pump.handle_frame(Frame::Message(message)).await;

        match rx.recv().await {
            Some(Frame::Ack(ack)) => {
                assert!(!ack.success);
                assert!(ack.error.unwrap().contains("unknown operation kind"));
            }
            other => panic!("expected failure ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admission_denied_for_mismatched_claim() {
        let state = state(true);
        let (tx, _rx) = mpsc::channel(SESSION_SEND_BUFFER);

        let err = SessionPump::admit(
            state,
            NodeId::new("edge-1"),
            NodeId::new("edge-2"),
            TransportKind::Unix,
            String::new(),
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdmitError::AuthorizationDenied(_)));
    }

    #[tokio::test]
    async fn test_frame_io_round_trip() {
        let frame = Frame::Keepalive {
            node: NodeId::new("edge-1"),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        match read_frame(&mut reader).await.unwrap() {
            Some(Frame::Keepalive { node }) => assert_eq!(node.as_str(), "edge-1"),
            other => panic!("unexpected: {:?}", other),
        }

        // Clean EOF yields None.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }
}
