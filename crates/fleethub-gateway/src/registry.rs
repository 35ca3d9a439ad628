//! Session registry: live edge sessions, the node-count ceiling, and
//! keepalive-driven eviction.
//!
//! At most one live session exists per node identity. A reconnect for an
//! identity supersedes the prior session: the old one is closed before the
//! new one is inserted, under the same lock, so the ceiling is never
//! double-counted during the swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleethub_core::{Frame, NodeId, SessionId, TransportKind};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Admission refused because the ceiling is reached.
    #[error("node limit of {0} reached")]
    NodeLimitExceeded(usize),

    /// No live session for the node.
    #[error("no live session for node {0}")]
    SessionNotFound(NodeId),

    /// Outbound send failed or exceeded the write timeout.
    #[error("send to node {0} failed")]
    SendFailed(NodeId),
}

/// One live edge session.
struct EdgeSession {
    session_id: SessionId,
    transport: TransportKind,
    cert_fingerprint: String,
    last_keepalive: DateTime<Utc>,
    connected_at: DateTime<Utc>,

    /// Outbound frame channel pumped by the session's transport task.
    tx: mpsc::Sender<Frame>,

    /// Per-session outbound send sequence.
    send_seq: Arc<AtomicU64>,

    /// Cancelled when the session is superseded or evicted.
    cancel: CancellationToken,
}

/// Handle returned to the transport that owns the connection.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub node: NodeId,

    /// Cancelled when the registry closes this session; the transport's
    /// read loop must exit when it fires.
    pub cancel: CancellationToken,
}

/// Snapshot of a session for the monitor surface.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub node: NodeId,
    pub session_id: SessionId,
    pub transport: TransportKind,
    pub cert_fingerprint: String,
    pub last_keepalive: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

/// Tracks live edge sessions and enforces the node-count ceiling.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<NodeId, EdgeSession>>,
    node_limit: usize,
    write_timeout: Duration,
}

impl SessionRegistry {
    /// Create a registry with the configured ceiling and write timeout.
    pub fn new(node_limit: usize, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            node_limit,
            write_timeout,
        })
    }

    /// Admit a new session for `node`.
    ///
    /// If a session for the identity already exists it is closed first
    /// (superseding writes win). Fails with `NodeLimitExceeded` when the
    /// ceiling is reached by other identities.
    pub async fn admit(
        &self,
        node: NodeId,
        transport: TransportKind,
        cert_fingerprint: String,
        tx: mpsc::Sender<Frame>,
    ) -> Result<SessionHandle, RegistryError> {
        let mut sessions = self.sessions.write().await;

        if let Some(old) = sessions.remove(&node) {
            info!(
                node = %node,
                old_session = %old.session_id,
                "Superseding existing session"
            );
            close_session(old, "superseded by new connection");
        } else if sessions.len() >= self.node_limit {
            warn!(node = %node, limit = self.node_limit, "Node limit reached, refusing session");
            return Err(RegistryError::NodeLimitExceeded(self.node_limit));
        }

        let session_id = SessionId::generate();
        let cancel = CancellationToken::new();
        let now = Utc::now();

        sessions.insert(
            node.clone(),
            EdgeSession {
                session_id: session_id.clone(),
                transport,
                cert_fingerprint,
                last_keepalive: now,
                connected_at: now,
                tx,
                send_seq: Arc::new(AtomicU64::new(0)),
                cancel: cancel.clone(),
            },
        );

        info!(node = %node, session = %session_id, transport = %transport, "Session admitted");

        Ok(SessionHandle {
            session_id,
            node,
            cancel,
        })
    }

    /// Record inbound traffic as a liveness signal.
    pub async fn touch(&self, node: &NodeId) {
        if let Some(session) = self.sessions.write().await.get_mut(node) {
            session.last_keepalive = Utc::now();
        }
    }

    /// Remove a session if `session_id` still names the live one.
    ///
    /// Idempotent: removing an already-removed or superseded session is a
    /// no-op, so disconnect cleanup and eviction cannot race each other into
    /// closing a replacement session.
    pub async fn remove(&self, node: &NodeId, session_id: &SessionId) {
        let mut sessions = self.sessions.write().await;
        let matches = sessions
            .get(node)
            .map(|s| &s.session_id == session_id)
            .unwrap_or(false);

        if matches {
            if let Some(old) = sessions.remove(node) {
                info!(node = %node, session = %session_id, "Session removed");
                close_session(old, "session closed");
            }
        } else {
            debug!(node = %node, session = %session_id, "Stale session removal ignored");
        }
    }

    /// Evict sessions silent longer than `threshold`.
    ///
    /// Returns the evicted node identities.
    pub async fn evict_stale(&self, threshold: Duration) -> Vec<NodeId> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());

        let mut sessions = self.sessions.write().await;
        let stale: Vec<NodeId> = sessions
            .iter()
            .filter(|(_, s)| s.last_keepalive < cutoff)
            .map(|(node, _)| node.clone())
            .collect();

        for node in &stale {
            if let Some(old) = sessions.remove(node) {
                warn!(
                    node = %node,
                    session = %old.session_id,
                    last_keepalive = %old.last_keepalive,
                    "Evicting stale session"
                );
                close_session(old, "keepalive timeout");
            }
        }

        stale
    }

    /// Send a frame to a node's live session, stamping the send sequence.
    ///
    /// A send that cannot complete within the write timeout marks the
    /// session dead and evicts it.
    pub async fn send_to_node(&self, node: &NodeId, frame: Frame) -> Result<u64, RegistryError> {
        let (tx, seq, session_id) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(node)
                .ok_or_else(|| RegistryError::SessionNotFound(node.clone()))?;
            let seq = session.send_seq.fetch_add(1, Ordering::SeqCst);
            (session.tx.clone(), seq, session.session_id.clone())
        };

        match tx
            .send_timeout(frame.with_seq(seq), self.write_timeout)
            .await
        {
            Ok(()) => Ok(seq),
            Err(_) => {
                warn!(node = %node, "Write timed out, evicting session");
                self.remove(node, &session_id).await;
                Err(RegistryError::SendFailed(node.clone()))
            }
        }
    }

    /// Whether `session_id` is still the live session for `node`.
    pub async fn is_live(&self, node: &NodeId, session_id: &SessionId) -> bool {
        self.sessions
            .read()
            .await
            .get(node)
            .map(|s| &s.session_id == session_id)
            .unwrap_or(false)
    }

    /// Number of live sessions.
    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Live-session counts per transport, for metrics.
    pub async fn count_by_transport(&self) -> HashMap<TransportKind, usize> {
        let sessions = self.sessions.read().await;
        let mut counts = HashMap::new();
        for session in sessions.values() {
            *counts.entry(session.transport).or_insert(0) += 1;
        }
        counts
    }

    /// Snapshot of all live sessions.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(node, s)| SessionInfo {
                node: node.clone(),
                session_id: s.session_id.clone(),
                transport: s.transport,
                cert_fingerprint: s.cert_fingerprint.clone(),
                last_keepalive: s.last_keepalive,
                connected_at: s.connected_at,
            })
            .collect()
    }

    /// Configured ceiling.
    pub fn node_limit(&self) -> usize {
        self.node_limit
    }

    /// Close every session (graceful shutdown).
    pub async fn close_all(&self, reason: &str) {
        let mut sessions = self.sessions.write().await;
        for (node, session) in sessions.drain() {
            debug!(node = %node, "Closing session on shutdown");
            close_session(session, reason);
        }
    }
}

/// Push a best-effort close frame and cancel the session's transport task.
fn close_session(session: EdgeSession, reason: &str) {
    let _ = session.tx.try_send(Frame::Close {
        reason: reason.to_string(),
    });
    session.cancel.cancel();
}

/// Periodically evict sessions that have gone silent.
///
/// The eviction threshold is twice the keepalive interval: one missed beat
/// is tolerated, two is eviction.
pub async fn run_keepalive_sweeper(
    registry: Arc<SessionRegistry>,
    keepalive_interval: Duration,
    shutdown: CancellationToken,
) {
    let threshold = keepalive_interval * 2;
    let mut ticker = tokio::time::interval(keepalive_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.evict_stale(threshold).await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Keepalive sweep evicted sessions");
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Keepalive sweeper stopping");
                return;
            }
        }
    }
}
