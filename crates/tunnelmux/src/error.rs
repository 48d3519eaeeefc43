//! Error types for the multiplexer

use std::time::Duration;
use thiserror::Error;
use tunnelmux_proto::{BindingKey, ProtocolError, TunnelId};
use tunnelmux_transport::TransportError;

/// Main error type for multiplexer operations.
///
/// Cloneable so the same failure can reach every subscriber of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// An active tunnel or live reservation already holds this binding
    #[error("Binding {0} already has an active tunnel")]
    DuplicateBinding(BindingKey),

    /// No pending reservation matches an assignment
    #[error("No pending reservation for binding {0}")]
    UnknownBinding(BindingKey),

    /// The server did not assign an id in time
    #[error("Tunnel for {binding} not opened within {timeout:?}")]
    OpenTimeout {
        /// Binding that was being opened
        binding: BindingKey,
        /// Configured open timeout
        timeout: Duration,
    },

    /// The consumer did not drain the tunnel fast enough
    #[error("Consumer of tunnel {0} stalled")]
    ConsumerStalled(TunnelId),

    /// The shared transport connection died
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// Malformed or unexpected frame
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server never acknowledged a close
    #[error("Close of tunnel {0} was not acknowledged")]
    CloseTimeout(TunnelId),

    /// The server refused to start a tunnel
    #[error("Server rejected {binding}: {message}")]
    Rejected {
        /// Binding that was refused
        binding: BindingKey,
        /// Server supplied reason
        message: String,
    },

    /// The server reported a failure of an open tunnel
    #[error("Tunnel {tunnel_id} failed remotely: {message}")]
    Remote {
        /// Failed tunnel
        tunnel_id: TunnelId,
        /// Server supplied reason
        message: String,
    },

    /// Transport could not be established
    #[error("Transport error: {0}")]
    Transport(String),

    /// The multiplexer has been shut down
    #[error("Multiplexer shut down")]
    Shutdown,
}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<ProtocolError> for MuxError {
    fn from(err: ProtocolError) -> Self {
        Self::ProtocolViolation(err.to_string())
    }
}

impl MuxError {
    /// Whether a fresh `open()` may succeed after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, MuxError::Shutdown | MuxError::DuplicateBinding(_))
    }
}
