//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The bytes are not a valid MessagePack frame envelope
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A known frame kind is missing one of its required fields
    #[error("Frame `{kind}` is missing required field `{field}`")]
    MissingField {
        /// Frame kind being decoded
        kind: String,
        /// Name of the absent field
        field: &'static str,
    },

    /// An unknown-kind frame named one of the known kinds, so it would not
    /// decode back to itself
    #[error("Frame kind `{0}` is known and cannot be sent as an unknown frame")]
    KnownKindAsUnknown(String),

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}
