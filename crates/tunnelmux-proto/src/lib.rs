//! # Tunnelmux Protocol
//!
//! Frame definitions and the codec for the tunnelmux interactive tunnel protocol.
//!
//! Every message exchanged between an operator client and the management server
//! is a [`Frame`]. Frames are encoded as self-describing MessagePack maps so that
//! peers speaking a newer protocol revision can add frame kinds and fields
//! without breaking older ones.

#![warn(missing_docs)]

/// Frame structure and identifiers
pub mod frame;

/// Frame codec
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use frame::{BindingKey, Frame, StartParams, StreamKind, TunnelId, WindowSize};
