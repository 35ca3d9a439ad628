//! Gateway configuration.
//!
//! Every struct carries defaults matching the shipped configuration file, so
//! a partial file (or none at all) yields a runnable gateway.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use fleethub_core::{OpKind, QueueTuning};

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Expected keepalive interval from edge nodes (seconds).
    pub keepalive_interval_secs: u64,

    /// Maximum number of edge nodes with a live session.
    pub node_limit: usize,

    /// Bounded wait for an outbound session send (seconds).
    pub write_timeout_secs: u64,

    /// Edge certificate validity issued by the gateway CA (days).
    pub edge_cert_validity_days: u64,

    /// Client-facing TLS material (WebSocket, QUIC, HTTPS).
    pub hub_tls: TlsDomainConfig,

    /// WebSocket listener.
    pub websocket: WebSocketConfig,

    /// QUIC listener.
    pub quic: QuicConfig,

    /// Unix-domain-socket listener.
    pub unix_socket: UnixSocketConfig,

    /// HTTPS listener (message ingress + certificate bootstrap).
    pub https: HttpsConfig,

    /// Tunnel relay listener.
    pub tunnel: TunnelConfig,

    /// Cluster-side stream channel used when the relay dials its target.
    pub stream: StreamConfig,

    /// Monitor server (health + metrics).
    pub monitor: MonitorConfig,

    /// Authorization gate.
    pub authorization: AuthorizationConfig,

    /// Per-kind queue capacity and worker-pool overrides.
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            node_limit: 1000,
            write_timeout_secs: 30,
            edge_cert_validity_days: 365,
            hub_tls: TlsDomainConfig::hub_defaults(),
            websocket: WebSocketConfig::default(),
            quic: QuicConfig::default(),
            unix_socket: UnixSocketConfig::default(),
            https: HttpsConfig::default(),
            tunnel: TunnelConfig::default(),
            stream: StreamConfig::default(),
            monitor: MonitorConfig::default(),
            authorization: AuthorizationConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// CA/cert/key paths for one trust domain.
///
/// The hub, tunnel, and stream domains are loaded independently and must
/// never share material.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsDomainConfig {
    /// CA certificate file (PEM).
    pub ca_file: String,

    /// CA private key file (PEM); required only where the gateway signs.
    pub ca_key_file: String,

    /// Server certificate file (PEM).
    pub cert_file: String,

    /// Server private key file (PEM).
    pub key_file: String,
}

impl TlsDomainConfig {
    fn hub_defaults() -> Self {
        Self {
            ca_file: "/etc/fleethub/ca/rootCA.crt".to_string(),
            ca_key_file: "/etc/fleethub/ca/rootCA.key".to_string(),
            cert_file: "/etc/fleethub/certs/server.crt".to_string(),
            key_file: "/etc/fleethub/certs/server.key".to_string(),
        }
    }

    fn tunnel_defaults() -> Self {
        Self {
            ca_file: "/etc/fleethub/ca/tunnelCA.crt".to_string(),
            ca_key_file: "/etc/fleethub/ca/tunnelCA.key".to_string(),
            cert_file: "/etc/fleethub/certs/tunnel.crt".to_string(),
            key_file: "/etc/fleethub/certs/tunnel.key".to_string(),
        }
    }

    fn stream_defaults() -> Self {
        Self {
            ca_file: "/etc/fleethub/ca/streamCA.crt".to_string(),
            ca_key_file: String::new(),
            cert_file: "/etc/fleethub/certs/stream.crt".to_string(),
            key_file: "/etc/fleethub/certs/stream.key".to_string(),
        }
    }
}

impl Default for TlsDomainConfig {
    fn default() -> Self {
        Self::hub_defaults()
    }
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSocketConfig {
    pub enable: bool,
    pub address: String,
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enable: true,
            address: "0.0.0.0".to_string(),
            port: 10000,
        }
    }
}

/// QUIC listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuicConfig {
    pub enable: bool,
    pub address: String,
    pub port: u16,

    /// Ceiling on concurrent incoming streams per connection.
    pub max_incoming_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: "0.0.0.0".to_string(),
            port: 10001,
            max_incoming_streams: 10000,
        }
    }
}

/// Unix-domain-socket listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnixSocketConfig {
    pub enable: bool,
    pub path: String,
}

impl Default for UnixSocketConfig {
    fn default() -> Self {
        Self {
            enable: true,
            path: "/var/lib/fleethub/fleethub.sock".to_string(),
        }
    }
}

/// HTTPS listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpsConfig {
    pub enable: bool,
    pub address: String,
    pub port: u16,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            address: "0.0.0.0".to_string(),
            port: 10002,
        }
    }
}

/// Tunnel relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelConfig {
    pub enable: bool,
    pub address: String,
    pub port: u16,

    /// Idle timeout after which both relay directions are torn down (seconds).
    pub idle_timeout_secs: u64,

    /// Tunnel trust domain, distinct from the hub domain.
    pub tls: TlsDomainConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enable: true,
            address: "0.0.0.0".to_string(),
            port: 10004,
            idle_timeout_secs: 60,
            tls: TlsDomainConfig::tunnel_defaults(),
        }
    }
}

/// Cluster-side stream channel configuration for relay targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Wrap relay target connections in TLS using the stream domain.
    pub use_tls: bool,

    /// Stream trust domain, distinct from hub and tunnel domains.
    pub tls: TlsDomainConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            use_tls: false,
            tls: TlsDomainConfig::stream_defaults(),
        }
    }
}

/// Monitor server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    pub enable: bool,
    pub bind_address: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable: true,
            bind_address: "127.0.0.1:9091".to_string(),
        }
    }
}

/// Authorization gate configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationConfig {
    /// Master switch; disabled means every evaluation allows.
    pub enable: bool,

    /// Log denials but deliver Allow to callers.
    pub debug: bool,

    /// Modes evaluated in order.
    pub modes: Vec<AuthorizationMode>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enable: false,
            debug: false,
            modes: vec![AuthorizationMode::Node],
        }
    }
}

/// An authorization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationMode {
    /// Claimed node identity must equal the certificate-derived identity.
    Node,
}

/// Per-kind dispatch overrides; unlisted kinds use their built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    pub overrides: HashMap<OpKind, QueueTuning>,
}

impl DispatchConfig {
    /// Effective tuning for a kind.
    pub fn tuning(&self, kind: OpKind) -> QueueTuning {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_tuning())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_shipped_ports() {
        let config = Config::default();
        assert_eq!(config.websocket.port, 10000);
        assert_eq!(config.quic.port, 10001);
        assert_eq!(config.https.port, 10002);
        assert_eq!(config.tunnel.port, 10004);
        assert_eq!(config.node_limit, 1000);
        assert_eq!(config.keepalive_interval_secs, 30);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"nodeLimit": 5, "quic": {"enable": true}}"#).unwrap();
        assert_eq!(config.node_limit, 5);
        assert!(config.quic.enable);
        assert_eq!(config.quic.max_incoming_streams, 10000);
        assert_eq!(config.websocket.port, 10000);
    }

    #[test]
    fn test_dispatch_override_wins() {
        let mut dispatch = DispatchConfig::default();
        dispatch.overrides.insert(
            OpKind::CreateLease,
            QueueTuning {
                capacity: 8,
                workers: 2,
            },
        );
        assert_eq!(dispatch.tuning(OpKind::CreateLease).capacity, 8);
        assert_eq!(
            dispatch.tuning(OpKind::QueryLease),
            OpKind::QueryLease.default_tuning()
        );
    }
}
