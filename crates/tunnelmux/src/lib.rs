//! # Tunnelmux
//!
//! Multiplexes an unbounded number of live, bidirectional byte streams
//! (interactive shells, port forwards, SOCKS data) over a single shared
//! transport connection to a management server.
//!
//! A consumer asks the [`Multiplexer`] to open a tunnel for a [`BindingKey`].
//! The server assigns the [`TunnelId`] asynchronously in the first frame it
//! sends back; until then the tunnel exists only as a pending reservation.
//! Once open, the consumer writes through its [`TunnelHandle`] and reads
//! through one or more [`TunnelStream`] subscriptions, each of which ends with
//! exactly one terminal event.
//!
//! Losing the transport kills every tunnel of that connection generation.

#![warn(missing_docs)]

pub use tunnelmux_proto as proto;
pub use tunnelmux_transport as transport;

/// Error types for the multiplexer
pub mod error;

/// Multiplexer configuration
pub mod config;

mod registry;

/// Per-tunnel state machine and inbound queue
pub mod tunnel;

/// Consumer-facing tunnel handles
pub mod handle;

/// The multiplexer and its driver task
pub mod mux;

/// Observability counters
pub mod stats;

pub use config::{MultiplexerBuilder, MuxConfig, ReconnectPolicy};
pub use error::MuxError;
pub use handle::{TunnelHandle, TunnelWriter};
pub use mux::Multiplexer;
pub use stats::StatsSnapshot;
pub use tunnel::{TunnelEvent, TunnelState, TunnelStream};
pub use tunnelmux_proto::{BindingKey, StartParams, StreamKind, TunnelId, WindowSize};
pub use tunnelmux_transport::{ConnectionState, Transport};

/// Result type alias for multiplexer operations
pub type Result<T> = std::result::Result<T, MuxError>;
