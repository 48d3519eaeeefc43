//! # Tunnelmux Transport
//!
//! Owns the single physical duplex connection between an operator client and
//! the management server. A [`Connection`] moves raw messages in arrival
//! order and reports the loss of the link exactly once; it knows nothing about
//! tunnels or frame semantics.

#![warn(missing_docs)]

/// Transport abstraction and the byte-stream transport
pub mod transport;

/// A live connection generation
pub mod connection;

/// WebSocket transport
pub mod websocket;

/// Transport-specific error types
pub mod error;

pub use connection::{
    Connection, ConnectionConfig, ConnectionState, MessageSender, SendPermit, TransportEvent,
};
pub use error::TransportError;
pub use transport::{StreamTransport, Transport};
pub use websocket::{WebSocketConfig, WebSocketTransport};
