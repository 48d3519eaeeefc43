//! Observability counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the driver task
#[derive(Debug, Default)]
pub(crate) struct MuxStats {
    pub(crate) frames_in: AtomicU64,
    pub(crate) frames_out: AtomicU64,
    pub(crate) unknown_tunnel_frames: AtomicU64,
    pub(crate) protocol_violations: AtomicU64,
    pub(crate) unknown_kinds: AtomicU64,
    pub(crate) tunnels_opened: AtomicU64,
    pub(crate) tunnels_errored: AtomicU64,
    pub(crate) generations: AtomicU64,
}

impl MuxStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            unknown_tunnel_frames: self.unknown_tunnel_frames.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            unknown_kinds: self.unknown_kinds.load(Ordering::Relaxed),
            tunnels_opened: self.tunnels_opened.load(Ordering::Relaxed),
            tunnels_errored: self.tunnels_errored.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the multiplexer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames received from the transport
    pub frames_in: u64,
    /// Frames handed to the transport
    pub frames_out: u64,
    /// Frames dropped because they named no live tunnel
    pub unknown_tunnel_frames: u64,
    /// Malformed or unexpected frames
    pub protocol_violations: u64,
    /// Frames of a kind this revision does not know
    pub unknown_kinds: u64,
    /// Tunnels that reached the open state
    pub tunnels_opened: u64,
    /// Tunnels that ended in the errored state
    pub tunnels_errored: u64,
    /// Connection generations established
    pub generations: u64,
}
