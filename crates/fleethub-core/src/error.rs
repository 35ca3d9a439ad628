//! Core domain errors.

use thiserror::Error;

/// Core domain errors for FleetHub.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Message names an operation kind outside the enumerable set.
    #[error("unknown operation kind: {0}")]
    UnknownOpKind(String),

    /// Frame could not be decoded.
    #[error("frame decode error: {0}")]
    FrameDecode(String),

    /// Frame could not be encoded.
    #[error("frame encode error: {0}")]
    FrameEncode(String),

    /// Frame exceeds the wire size ceiling.
    #[error("frame of {0} bytes exceeds maximum of {1}")]
    FrameTooLarge(usize, usize),
}
