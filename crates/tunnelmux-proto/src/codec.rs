//! Frame codec
//!
//! Frames travel as MessagePack maps with a `kind` discriminator plus the
//! fields that kind needs. Fields are optional on the wire so that a single
//! envelope covers every kind, unknown fields are ignored, and unknown kinds
//! decode to [`Frame::Unknown`].

use crate::frame::{BindingKey, Frame, StartParams, TunnelId, WindowSize};
use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Flat wire envelope shared by every frame kind
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct WireFrame {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel_id: Option<TunnelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    binding: Option<BindingKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<StartParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl WireFrame {
    fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }
}

fn require<T>(kind: &str, value: Option<T>, field: &'static str) -> Result<T, ProtocolError> {
    value.ok_or_else(|| ProtocolError::MissingField {
        kind: kind.to_string(),
        field,
    })
}

impl From<&Frame> for WireFrame {
    fn from(frame: &Frame) -> Self {
        let mut wire = WireFrame::of_kind(frame.kind());
        match frame {
            Frame::Start { binding, params } => {
                wire.binding = Some(binding.clone());
                wire.params = Some(params.clone());
            }
            Frame::Data {
                tunnel_id,
                binding,
                payload,
            } => {
                wire.tunnel_id = Some(*tunnel_id);
                wire.binding = binding.clone();
                wire.payload = Some(payload.clone());
            }
            Frame::Resize { tunnel_id, size } => {
                wire.tunnel_id = Some(*tunnel_id);
                wire.cols = Some(size.cols);
                wire.rows = Some(size.rows);
            }
            Frame::Close { tunnel_id, reason } => {
                wire.tunnel_id = Some(*tunnel_id);
                wire.reason = Some(reason.clone());
            }
            Frame::Error {
                tunnel_id,
                binding,
                message,
            } => {
                wire.tunnel_id = *tunnel_id;
                wire.binding = binding.clone();
                wire.message = Some(message.clone());
            }
            Frame::Unknown { .. } => {}
        }
        wire
    }
}

impl TryFrom<WireFrame> for Frame {
    type Error = ProtocolError;

    fn try_from(wire: WireFrame) -> Result<Self, ProtocolError> {
        let WireFrame {
            kind,
            tunnel_id,
            binding,
            params,
            payload,
            cols,
            rows,
            reason,
            message,
        } = wire;

        let frame = match kind.as_str() {
            Frame::START => Frame::Start {
                binding: require(&kind, binding, "binding")?,
                params: params.unwrap_or_default(),
            },
            Frame::DATA => Frame::Data {
                tunnel_id: require(&kind, tunnel_id, "tunnel_id")?,
                binding,
                payload: payload.unwrap_or_default(),
            },
            Frame::RESIZE => Frame::Resize {
                tunnel_id: require(&kind, tunnel_id, "tunnel_id")?,
                size: WindowSize {
                    cols: require(&kind, cols, "cols")?,
                    rows: require(&kind, rows, "rows")?,
                },
            },
            Frame::CLOSE => Frame::Close {
                tunnel_id: require(&kind, tunnel_id, "tunnel_id")?,
                reason: reason.unwrap_or_default(),
            },
            Frame::ERROR => Frame::Error {
                tunnel_id,
                binding,
                message: message.unwrap_or_default(),
            },
            _ => Frame::Unknown { kind },
        };
        Ok(frame)
    }
}

/// Codec turning [`Frame`]s into transport messages and back
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum encoded frame size allowed
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum encoded frame size this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame to bytes
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        if let Frame::Unknown { kind } = frame {
            if Frame::is_known_kind(kind) {
                return Err(ProtocolError::KnownKindAsUnknown(kind.clone()));
            }
        }

        let bytes = rmp_serde::to_vec_named(&WireFrame::from(frame))?;

        if bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }

        Ok(Bytes::from(bytes))
    }

    /// Decode a frame from bytes.
    ///
    /// Never panics: malformed input is reported as a [`ProtocolError`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, ProtocolError> {
        if bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }

        let wire: WireFrame = rmp_serde::from_slice(bytes)?;
        Frame::try_from(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StreamKind;
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::new()
    }

    #[test]
    fn test_data_frame_encode_decode() {
        let frame = Frame::data(TunnelId(42), Bytes::from("ls\n"));
        let encoded = codec().encode(&frame).unwrap();
        assert_eq!(codec().decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_assignment_frame_keeps_binding() {
        let binding = BindingKey::shell("sessionX");
        let frame = Frame::assign(TunnelId(7), binding.clone(), Bytes::new());
        let decoded = codec().decode(&codec().encode(&frame).unwrap()).unwrap();

        match decoded {
            Frame::Data {
                tunnel_id,
                binding: Some(b),
                payload,
            } => {
                assert_eq!(tunnel_id, TunnelId(7));
                assert_eq!(b, binding);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut params = StartParams::new();
        params.insert("rows".into(), "24".into());
        params.insert("cols".into(), "80".into());
        params.insert("env.TERM".into(), "xterm".into());
        let frame = Frame::start(BindingKey::shell("s"), params);

        let a = codec().encode(&frame).unwrap();
        let b = codec().encode(&frame.clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_kind_is_forward_compatible() {
        #[derive(Serialize)]
        struct Future<'a> {
            kind: &'a str,
            tunnel_id: u64,
            window: u32,
        }

        let bytes = rmp_serde::to_vec_named(&Future {
            kind: "window_update",
            tunnel_id: 3,
            window: 4096,
        })
        .unwrap();

        assert_eq!(
            codec().decode(&bytes).unwrap(),
            Frame::Unknown {
                kind: "window_update".into()
            }
        );
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        #[derive(Serialize)]
        struct Extended<'a> {
            kind: &'a str,
            tunnel_id: u64,
            reason: &'a str,
            sequence: u64,
        }

        let bytes = rmp_serde::to_vec_named(&Extended {
            kind: "close",
            tunnel_id: 9,
            reason: "exit",
            sequence: 12,
        })
        .unwrap();

        assert_eq!(
            codec().decode(&bytes).unwrap(),
            Frame::close(TunnelId(9), "exit")
        );
    }

    #[test]
    fn test_missing_required_field() {
        #[derive(Serialize)]
        struct Partial<'a> {
            kind: &'a str,
            cols: u16,
        }

        let bytes = rmp_serde::to_vec_named(&Partial {
            kind: "resize",
            cols: 80,
        })
        .unwrap();

        assert_eq!(
            codec().decode(&bytes),
            Err(ProtocolError::MissingField {
                kind: "resize".into(),
                field: "tunnel_id"
            })
        );
    }

    #[test]
    fn test_invalid_frame_data() {
        let result = codec().decode(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));

        let result = codec().decode(&[]);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(100);
        let frame = Frame::data(TunnelId(1), Bytes::from(vec![0u8; 200]));

        assert!(matches!(
            codec.encode(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(matches!(
            codec.decode(&[0u8; 200]),
            Err(ProtocolError::FrameTooLarge { size: 200, max: 100 })
        ));
    }

    fn arb_stream_kind() -> impl Strategy<Value = StreamKind> {
        prop_oneof![
            Just(StreamKind::Shell),
            Just(StreamKind::PortForward),
            Just(StreamKind::Socks),
            "[a-z_]{1,12}".prop_map(StreamKind::Custom),
        ]
    }

    fn arb_binding() -> impl Strategy<Value = BindingKey> {
        (
            "[A-Za-z0-9-]{0,24}",
            arb_stream_kind(),
            proptest::option::of("[a-z0-9]{1,8}"),
        )
            .prop_map(|(target, kind, nonce)| BindingKey {
                target,
                kind,
                nonce,
            })
    }

    fn arb_tunnel_id() -> impl Strategy<Value = TunnelId> {
        any::<u64>().prop_map(TunnelId)
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        prop_oneof![
            (
                arb_binding(),
                prop::collection::btree_map("[a-z.]{1,8}", ".{0,16}", 0..4)
            )
                .prop_map(|(binding, params)| Frame::Start { binding, params }),
            (
                arb_tunnel_id(),
                proptest::option::of(arb_binding()),
                prop::collection::vec(any::<u8>(), 0..512)
            )
                .prop_map(|(tunnel_id, binding, payload)| Frame::Data {
                    tunnel_id,
                    binding,
                    payload: Bytes::from(payload),
                }),
            (arb_tunnel_id(), any::<u16>(), any::<u16>())
                .prop_map(|(id, cols, rows)| Frame::resize(id, WindowSize::new(cols, rows))),
            (arb_tunnel_id(), ".{0,32}").prop_map(|(id, reason)| Frame::close(id, reason)),
            (
                proptest::option::of(arb_tunnel_id()),
                proptest::option::of(arb_binding()),
                ".{0,32}"
            )
                .prop_map(|(tunnel_id, binding, message)| Frame::Error {
                    tunnel_id,
                    binding,
                    message,
                }),
            // Known kinds are refused by encode, see below
            "[a-z_]{1,12}"
                .prop_filter("known kind", |k| !Frame::is_known_kind(k))
                .prop_map(|kind| Frame::Unknown { kind }),
        ]
    }

    proptest! {
        #[test]
        fn test_frame_roundtrip_properties(frame in arb_frame()) {
            let codec = FrameCodec::new();
            let encoded = codec.encode(&frame).unwrap();
            let decoded = codec.decode(&encoded).unwrap();
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn test_encode_refuses_unknown_frames_named_like_known_ones(
            kind in prop::sample::select(vec![
                Frame::START,
                Frame::DATA,
                Frame::RESIZE,
                Frame::CLOSE,
                Frame::ERROR,
            ])
        ) {
            let frame = Frame::Unknown { kind: kind.to_string() };
            prop_assert_eq!(
                FrameCodec::new().encode(&frame),
                Err(ProtocolError::KnownKindAsUnknown(kind.to_string()))
            );
        }

        #[test]
        fn test_decode_is_total(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            // Any outcome is fine as long as decoding returns instead of panicking
            let _ = FrameCodec::new().decode(&bytes);
        }
    }
}
