//! FleetHub Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/TLS
//! - Async runtime specifics
//!
//! All types here represent the core domain of the FleetHub gateway.

pub mod error;
pub mod frame;
pub mod ids;
pub mod opkind;
pub mod transport;

// Re-export commonly used types
pub use error::CoreError;
pub use frame::{Ack, EdgeMessage, Frame, Hello, MAX_FRAME_LEN};
pub use ids::{MessageId, NodeId, SessionId};
pub use opkind::{OpKind, QueueTuning};
pub use transport::TransportKind;
