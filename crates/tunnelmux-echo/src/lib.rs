//! # Tunnelmux Echo
//!
//! A loopback server speaking the server side of the tunnelmux wire
//! protocol. It assigns tunnel ids, echoes data and resizes back, and closes
//! a tunnel when it receives [`EXIT_COMMAND`]. Integration tests and demos
//! run the multiplexer against it.

#![warn(missing_docs)]

/// Per-connection protocol loop
pub mod server;

/// TCP and WebSocket accept loops
pub mod listener;

pub use listener::{serve_tcp, serve_websocket};
pub use server::{EchoOptions, EchoServer, EXIT_COMMAND};
