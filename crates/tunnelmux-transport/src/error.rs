//! Transport-specific error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connecting took too long
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The connection has already been lost
    #[error("Not connected")]
    NotConnected,
}
