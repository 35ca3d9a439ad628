//! Transport kinds an edge session can arrive over.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The transport a session was accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    Quic,
    Unix,
    Https,
}

impl TransportKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Quic => "quic",
            TransportKind::Unix => "unix",
            TransportKind::Https => "https",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
