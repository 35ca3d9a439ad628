//! Wire frames exchanged with edge nodes.
//!
//! Frames are JSON documents. WebSocket carries one frame per text message;
//! byte-stream transports (QUIC, Unix socket, tunnel control) carry frames
//! with a 4-byte big-endian length prefix.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::ids::{MessageId, NodeId};
use crate::opkind::OpKind;

/// Maximum encoded frame body size on byte-stream transports.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A frame on the edge wire, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of a Unix-socket session; carries the caller's
    /// certificate so identity flows through the same path as TLS peers.
    Hello(Hello),

    /// Liveness beat, either direction.
    Keepalive { node: NodeId },

    /// Edge-originated work message.
    Message(EdgeMessage),

    /// Cloud-originated push, stamped with the session send sequence.
    Push { seq: u64, message: EdgeMessage },

    /// Acknowledgment of a previously received message.
    Ack(Ack),

    /// Orderly close with a reason the peer can log.
    Close { reason: String },
}

/// Session hello for transports without network TLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Node identity the caller claims.
    pub node: NodeId,

    /// PEM certificate backing the claim.
    pub cert_pem: String,
}

/// An edge work message, classified by `op` into an [`OpKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeMessage {
    /// Unique message id, echoed in acks.
    pub id: MessageId,

    /// Node the message claims to originate from (or is destined for).
    pub node: NodeId,

    /// Wire name of the operation kind.
    pub op: String,

    /// Operation payload, opaque to the router.
    pub payload: Value,

    /// Sender-side timestamp (milliseconds since epoch).
    pub timestamp_ms: i64,
}

impl EdgeMessage {
    /// Build a message with a generated id and current timestamp.
    pub fn new(node: NodeId, op: OpKind, payload: Value) -> Self {
        Self {
            id: MessageId::generate(),
            node,
            op: op.as_str().to_string(),
            payload,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Acknowledgment frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    /// Session send sequence, stamped on delivery.
    pub seq: u64,

    /// Id of the message being acknowledged.
    pub ref_id: MessageId,

    /// Whether the operation succeeded.
    pub success: bool,

    /// Terminal error description on failure.
    pub error: Option<String>,

    /// Response body for query-style operations.
    pub body: Option<Value>,
}

impl Ack {
    /// Successful ack without a body.
    pub fn ok(ref_id: MessageId) -> Self {
        Self {
            seq: 0,
            ref_id,
            success: true,
            error: None,
            body: None,
        }
    }

    /// Successful ack carrying a query response body.
    pub fn ok_with_body(ref_id: MessageId, body: Value) -> Self {
        Self {
            seq: 0,
            ref_id,
            success: true,
            error: None,
            body: Some(body),
        }
    }

    /// Terminal failure ack.
    pub fn failure(ref_id: MessageId, error: impl Into<String>) -> Self {
        Self {
            seq: 0,
            ref_id,
            success: false,
            error: Some(error.into()),
            body: None,
        }
    }
}

impl Frame {
    /// Stamp the session send sequence onto sequenced outbound variants.
    pub fn with_seq(mut self, seq: u64) -> Self {
        match &mut self {
            Frame::Push { seq: s, .. } => *s = seq,
            Frame::Ack(ack) => ack.seq = seq,
            _ => {}
        }
        self
    }

    /// Serialize to a JSON string (WebSocket text payload).
    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::FrameEncode(e.to_string()))
    }

    /// Parse from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, CoreError> {
        serde_json::from_str(s).map_err(|e| CoreError::FrameDecode(e.to_string()))
    }

    /// Encode as a length-prefixed buffer for byte-stream transports.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let body = serde_json::to_vec(self).map_err(|e| CoreError::FrameEncode(e.to_string()))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(CoreError::FrameTooLarge(body.len(), MAX_FRAME_LEN));
        }
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a frame body (length prefix already consumed).
    pub fn decode_body(body: &[u8]) -> Result<Self, CoreError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(CoreError::FrameTooLarge(body.len(), MAX_FRAME_LEN));
        }
        serde_json::from_slice(body).map_err(|e| CoreError::FrameDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_length_prefixed_encode_decode() {
        let msg = EdgeMessage::new(
            NodeId::new("edge-1"),
            OpKind::UpdatePodStatus,
            json!({"pod": "nginx", "phase": "Running"}),
        );
        let frame = Frame::Message(msg.clone());

        let buf = frame.encode().unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        match Frame::decode_body(&buf[4..]).unwrap() {
            Frame::Message(decoded) => {
                assert_eq!(decoded.id, msg.id);
                assert_eq!(decoded.op, "update_pod_status");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_json_round_trip_keepalive() {
        let frame = Frame::Keepalive {
            node: NodeId::new("edge-2"),
        };
        let text = frame.to_json().unwrap();
        match Frame::from_json(&text).unwrap() {
            Frame::Keepalive { node } => assert_eq!(node.as_str(), "edge-2"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_with_seq_stamps_push_and_ack() {
        let msg = EdgeMessage::new(NodeId::new("edge-1"), OpKind::QueryLease, json!({}));
        let push = Frame::Push {
            seq: 0,
            message: msg.clone(),
        }
        .with_seq(7);
        assert!(matches!(push, Frame::Push { seq: 7, .. }));

        let ack = Frame::Ack(Ack::ok(msg.id)).with_seq(9);
        match ack {
            Frame::Ack(a) => assert_eq!(a.seq, 9),
            other => panic!("unexpected frame: {:?}", other),
        }

        // Non-sequenced variants are left alone.
        let ka = Frame::Keepalive {
            node: NodeId::new("edge-1"),
        }
        .with_seq(3);
        assert!(matches!(ka, Frame::Keepalive { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode_body(b"not json").is_err());
    }
}
