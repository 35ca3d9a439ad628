//! Tunnel relay: a byte-level proxy channel distinct from the message
//! dispatch path.
//!
//! The relay listens on its own port with its own trust domain. A client
//! opens a TLS connection, sends one relay-open request naming the
//! cluster-side target, and from then on bytes are forwarded verbatim until
//! either side closes or the idle timeout elapses. Both directions are torn
//! down together.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::crypto::extract_node_name_from_cert;

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed relay-open request: {0}")]
    BadOpen(String),

    #[error("invalid relay target: {0}")]
    BadTarget(String),
}

/// First (and only) structured message on a relay connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpen {
    /// Caller-chosen identifier for this relayed stream.
    pub session_id: String,

    /// Cluster-side `host:port` to connect to.
    pub target: String,
}

/// A live relayed stream.
#[derive(Debug, Clone)]
pub struct TunnelRoute {
    pub session_id: String,
    pub node: String,
    pub target: String,
    pub opened_at: DateTime<Utc>,
}

/// The relay server.
pub struct TunnelServer {
    config: TunnelConfig,

    /// Client TLS for dialing targets over the stream trust domain, when
    /// configured.
    stream_tls: Option<Arc<rustls::ClientConfig>>,

    routes: RwLock<HashMap<String, TunnelRoute>>,
}

impl TunnelServer {
    pub fn new(config: TunnelConfig, stream_tls: Option<Arc<rustls::ClientConfig>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stream_tls,
            routes: RwLock::new(HashMap::new()),
        })
    }

    /// Number of live relayed streams.
    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Bind the tunnel listener and relay until shutdown.
    pub async fn run(
        self: Arc<Self>,
        tls: Arc<rustls::ServerConfig>,
        shutdown: CancellationToken,
    ) -> Result<(), TunnelError> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(TunnelError::Bind)?;
        let acceptor = TlsAcceptor::from(tls);

        info!(addr = %addr, "Tunnel listener started");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(acceptor, stream).await {
                            debug!(peer = %peer, error = %e, "Relay ended with error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("Tunnel listener stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        acceptor: TlsAcceptor,
        stream: TcpStream,
    ) -> Result<(), TunnelError> {
        let mut tls_stream = match acceptor.accept(stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Tunnel TLS handshake failed");
                return Ok(());
            }
        };

        let node = {
            let (_, connection) = tls_stream.get_ref();
            connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|leaf| extract_node_name_from_cert(leaf.as_ref()).ok())
        };
        let Some(node) = node else {
            warn!("Tunnel peer presented no usable certificate identity");
            return Ok(());
        };

        let open = read_open(&mut tls_stream).await?;
        let (host, _port) = split_target(&open.target)?;

        info!(
            node = %node,
            session_id = %open.session_id,
            target = %open.target,
            "Relay opened"
        );

        self.routes.write().await.insert(
            open.session_id.clone(),
            TunnelRoute {
                session_id: open.session_id.clone(),
                node: node.clone(),
                target: open.target.clone(),
                opened_at: Utc::now(),
            },
        );

        let idle_timeout = std::time::Duration::from_secs(self.config.idle_timeout_secs);
        let target_stream = TcpStream::connect(&open.target).await;

        let result = match target_stream {
            Ok(target) => match &self.stream_tls {
                Some(client_config) => {
                    let server_name = ServerName::try_from(host.to_string())
                        .map_err(|e| TunnelError::BadTarget(e.to_string()))?;
                    let connector = TlsConnector::from(client_config.clone());
                    match connector.connect(server_name, target).await {
                        Ok(target_tls) => relay(tls_stream, target_tls, idle_timeout).await,
                        Err(e) => {
                            warn!(target = %open.target, error = %e, "Stream TLS connect failed");
                            Err(e)
                        }
                    }
                }
                None => relay(tls_stream, target, idle_timeout).await,
            },
            Err(e) => {
                warn!(target = %open.target, error = %e, "Relay target unreachable");
                Err(e)
            }
        };

        self.routes.write().await.remove(&open.session_id);

        match result {
            Ok((up, down)) => {
                info!(
                    node = %node,
                    session_id = %open.session_id,
                    bytes_up = up,
                    bytes_down = down,
                    "Relay closed"
                );
            }
            Err(e) => {
                debug!(session_id = %open.session_id, error = %e, "Relay torn down");
            }
        }

        Ok(())
    }
}

/// Read the length-prefixed relay-open request.
async fn read_open<R>(reader: &mut R) -> Result<TunnelOpen, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 64 * 1024 {
        return Err(TunnelError::BadOpen(format!("open request of {len} bytes")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| TunnelError::BadOpen(e.to_string()))
}

/// Validate and split a `host:port` target.
fn split_target(target: &str) -> Result<(&str, u16), TunnelError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::BadTarget(target.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TunnelError::BadTarget(target.to_string()))?;
    if host.is_empty() {
        return Err(TunnelError::BadTarget(target.to_string()));
    }
    Ok((host, port))
}

/// Forward bytes both ways until either side closes or the idle timeout
/// elapses since the last transfer, then shut both ends down together.
async fn relay<A, B>(
    mut edge: A,
    mut target: B,
    idle_timeout: std::time::Duration,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut edge_buf = vec![0u8; 16 * 1024];
    let mut target_buf = vec![0u8; 16 * 1024];
    let mut up: u64 = 0;
    let mut down: u64 = 0;

    loop {
        tokio::select! {
            read = edge.read(&mut edge_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                target.write_all(&edge_buf[..n]).await?;
                up += n as u64;
            }
            read = target.read(&mut target_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                edge.write_all(&target_buf[..n]).await?;
                down += n as u64;
            }
            // Recreated each iteration: fires only after a full quiet period.
            _ = tokio::time::sleep(idle_timeout) => {
                debug!("Relay idle timeout");
                break;
            }
        }
    }

    // No half-open leaks: both ends close together.
    let _ = edge.shutdown().await;
    let _ = target.shutdown().await;

    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("10.0.0.1:10350").unwrap(), ("10.0.0.1", 10350));
        assert_eq!(
            split_target("kubelet.internal:10250").unwrap(),
            ("kubelet.internal", 10250)
        );
        assert!(split_target("no-port").is_err());
        assert!(split_target(":123").is_err());
        assert!(split_target("host:notaport").is_err());
    }

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let (edge_near, mut edge_far) = tokio::io::duplex(1024);
        let (target_near, mut target_far) = tokio::io::duplex(1024);

        let relay_task = tokio::spawn(relay(edge_near, target_near, Duration::from_secs(5)));

        edge_far.write_all(b"from-edge").await.unwrap();
        let mut buf = [0u8; 9];
        target_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-edge");

        target_far.write_all(b"from-cloud").await.unwrap();
        let mut buf = [0u8; 10];
        edge_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-cloud");

        // Closing one side tears the whole relay down.
        drop(edge_far);
        let (up, down) = relay_task.await.unwrap().unwrap();
        assert_eq!(up, 9);
        assert_eq!(down, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout_tears_down_both_ends() {
        let (edge_near, mut edge_far) = tokio::io::duplex(1024);
        let (target_near, mut target_far) = tokio::io::duplex(1024);

        let relay_task = tokio::spawn(relay(edge_near, target_near, Duration::from_secs(60)));

        // Quiet connection: the relay ends on its own after the idle window.
        let (up, down) = relay_task.await.unwrap().unwrap();
        assert_eq!((up, down), (0, 0));

        // Both ends observe EOF.
        let mut buf = [0u8; 1];
        assert_eq!(edge_far.read(&mut buf).await.unwrap(), 0);
        assert_eq!(target_far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_open_parses_request() {
        let open = TunnelOpen {
            session_id: "s-1".to_string(),
            target: "127.0.0.1:9000".to_string(),
        };
        let body = serde_json::to_vec(&open).unwrap();
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);

        let mut reader = std::io::Cursor::new(framed);
        let parsed = read_open(&mut reader).await.unwrap();
        assert_eq!(parsed.session_id, "s-1");
        assert_eq!(parsed.target, "127.0.0.1:9000");
    }
}
