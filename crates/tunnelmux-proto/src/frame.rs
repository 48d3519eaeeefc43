//! Frame structure and identifiers

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Server-assigned tunnel identifier.
///
/// Unique for the lifetime of the transport connection that carried the
/// assignment. Clients never choose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub u64);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TunnelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Kind of duplex stream carried by a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Interactive shell
    Shell,
    /// TCP port forward
    PortForward,
    /// SOCKS proxy data
    Socks,
    /// Any other stream kind understood by the server
    Custom(String),
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Shell => f.write_str("shell"),
            StreamKind::PortForward => f.write_str("port_forward"),
            StreamKind::Socks => f.write_str("socks"),
            StreamKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Client-side correlation key for a tunnel.
///
/// A tunnel is known only by its binding key until the server assigns a
/// [`TunnelId`]. The target is an opaque session or beacon identifier; the
/// optional nonce allows several concurrent tunnels of the same kind to the
/// same target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingKey {
    /// Opaque target identifier (session or beacon)
    pub target: String,
    /// Stream kind
    pub kind: StreamKind,
    /// Distinguishing nonce
    #[serde(default)]
    pub nonce: Option<String>,
}

impl BindingKey {
    /// Create a binding key for `kind` on `target`
    pub fn new(target: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            target: target.into(),
            kind,
            nonce: None,
        }
    }

    /// Binding key for an interactive shell on `target`
    pub fn shell(target: impl Into<String>) -> Self {
        Self::new(target, StreamKind::Shell)
    }

    /// Attach a distinguishing nonce
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)?;
        if let Some(nonce) = &self.nonce {
            write!(f, "#{}", nonce)?;
        }
        Ok(())
    }
}

/// Terminal geometry carried by resize frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Columns
    pub cols: u16,
    /// Rows
    pub rows: u16,
}

impl WindowSize {
    /// Create a window size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Parameters sent with a `start` frame.
///
/// Sorted so that encoding is deterministic.
pub type StartParams = BTreeMap<String, String>;

/// One discrete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request a new tunnel for a binding
    Start {
        /// Binding the tunnel is requested for
        binding: BindingKey,
        /// Opaque start parameters
        params: StartParams,
    },
    /// Payload for a tunnel
    Data {
        /// Tunnel the payload belongs to
        tunnel_id: TunnelId,
        /// Present on the first frame of a tunnel: the id assignment
        binding: Option<BindingKey>,
        /// Opaque payload bytes
        payload: Bytes,
    },
    /// Terminal geometry change
    Resize {
        /// Target tunnel
        tunnel_id: TunnelId,
        /// New geometry
        size: WindowSize,
    },
    /// Close request or acknowledgement
    Close {
        /// Tunnel being closed
        tunnel_id: TunnelId,
        /// Human readable reason
        reason: String,
    },
    /// Error report, optionally scoped to a tunnel or a pending binding
    Error {
        /// Tunnel the error concerns
        tunnel_id: Option<TunnelId>,
        /// Pending binding the error concerns (rejected `start`)
        binding: Option<BindingKey>,
        /// Error message
        message: String,
    },
    /// A frame kind this revision of the protocol does not know.
    ///
    /// Produced by decoding; `kind` is never one of the known kinds there.
    /// Encoding refuses a hand-built one that names a known kind.
    Unknown {
        /// The unrecognised kind discriminator
        kind: String,
    },
}

impl Frame {
    /// Kind discriminator for `start` frames
    pub const START: &'static str = "start";
    /// Kind discriminator for `data` frames
    pub const DATA: &'static str = "data";
    /// Kind discriminator for `resize` frames
    pub const RESIZE: &'static str = "resize";
    /// Kind discriminator for `close` frames
    pub const CLOSE: &'static str = "close";
    /// Kind discriminator for `error` frames
    pub const ERROR: &'static str = "error";

    /// Create a start frame
    pub fn start(binding: BindingKey, params: StartParams) -> Self {
        Self::Start { binding, params }
    }

    /// Create a data frame
    pub fn data(tunnel_id: TunnelId, payload: Bytes) -> Self {
        Self::Data {
            tunnel_id,
            binding: None,
            payload,
        }
    }

    /// Create the first data frame of a tunnel, which assigns `tunnel_id` to `binding`
    pub fn assign(tunnel_id: TunnelId, binding: BindingKey, payload: Bytes) -> Self {
        Self::Data {
            tunnel_id,
            binding: Some(binding),
            payload,
        }
    }

    /// Create a resize frame
    pub fn resize(tunnel_id: TunnelId, size: WindowSize) -> Self {
        Self::Resize { tunnel_id, size }
    }

    /// Create a close frame
    pub fn close(tunnel_id: TunnelId, reason: impl Into<String>) -> Self {
        Self::Close {
            tunnel_id,
            reason: reason.into(),
        }
    }

    /// Create an error frame scoped to a tunnel
    pub fn error(tunnel_id: Option<TunnelId>, message: impl Into<String>) -> Self {
        Self::Error {
            tunnel_id,
            binding: None,
            message: message.into(),
        }
    }

    /// Create an error frame rejecting a pending binding
    pub fn reject(binding: BindingKey, message: impl Into<String>) -> Self {
        Self::Error {
            tunnel_id: None,
            binding: Some(binding),
            message: message.into(),
        }
    }

    /// Kind discriminator of this frame
    pub fn kind(&self) -> &str {
        match self {
            Frame::Start { .. } => Self::START,
            Frame::Data { .. } => Self::DATA,
            Frame::Resize { .. } => Self::RESIZE,
            Frame::Close { .. } => Self::CLOSE,
            Frame::Error { .. } => Self::ERROR,
            Frame::Unknown { kind } => kind,
        }
    }

    /// Tunnel this frame is addressed to, if any
    pub fn tunnel_id(&self) -> Option<TunnelId> {
        match self {
            Frame::Data { tunnel_id, .. }
            | Frame::Resize { tunnel_id, .. }
            | Frame::Close { tunnel_id, .. } => Some(*tunnel_id),
            Frame::Error { tunnel_id, .. } => *tunnel_id,
            Frame::Start { .. } | Frame::Unknown { .. } => None,
        }
    }

    /// Whether `kind` names a frame kind this revision understands
    pub fn is_known_kind(kind: &str) -> bool {
        matches!(
            kind,
            Self::START | Self::DATA | Self::RESIZE | Self::CLOSE | Self::ERROR
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_key_display() {
        assert_eq!(BindingKey::shell("sessionX").to_string(), "shell:sessionX");
        assert_eq!(
            BindingKey::new("b-1", StreamKind::Custom("files".into()))
                .with_nonce("2")
                .to_string(),
            "files:b-1#2"
        );
    }

    #[test]
    fn test_nonce_distinguishes_bindings() {
        let a = BindingKey::shell("s");
        let b = BindingKey::shell("s").with_nonce("n");
        assert_ne!(a, b);
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::data(TunnelId(42), Bytes::from_static(b"ls\n"));
        assert_eq!(frame.kind(), "data");
        assert_eq!(frame.tunnel_id(), Some(TunnelId(42)));

        let start = Frame::start(BindingKey::shell("s"), StartParams::new());
        assert_eq!(start.kind(), "start");
        assert_eq!(start.tunnel_id(), None);

        let unknown = Frame::Unknown { kind: "ping".into() };
        assert_eq!(unknown.kind(), "ping");
        assert!(!Frame::is_known_kind("ping"));
        assert!(Frame::is_known_kind("close"));
    }
}
