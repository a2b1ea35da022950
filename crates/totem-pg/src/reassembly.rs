//! Fragment reassembly, keyed by (ring, originator, first-fragment MSN).

use std::collections::HashMap;

use totem_types::{Msn, NodeId, RingId};

use crate::error::{PgError, Result};
use crate::packer::{PackedFrame, PgMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    ring: RingId,
    originator: NodeId,
}

/// Identifies one fully-reassembled (or in-progress) fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub ring: RingId,
    pub originator: NodeId,
    pub first_msn: Msn,
}

struct Partial {
    first_msn: Msn,
    service: u8,
    total_len: u32,
    data: Vec<u8>,
}

/// Holds in-progress fragment streams. A node can only have one
/// fragmented message in flight at a time (it must wait for the next
/// token visit to send the next fragment), so streams are keyed by
/// `(ring, originator)` rather than needing the first MSN up front —
/// the first MSN is recorded when the stream opens and reported back
/// alongside the reassembled message.
#[derive(Default)]
pub struct Reassembler {
    current_ring: Option<RingId>,
    streams: HashMap<StreamKey, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the current ring. Any in-progress reassembly keyed to a
    /// different ring is discarded wholesale: a reassembly buffer is
    /// dropped once its ring is no longer current.
    pub fn set_current_ring(&mut self, ring: RingId) {
        if self.current_ring == Some(ring) {
            return;
        }
        self.current_ring = Some(ring);
        let before = self.streams.len();
        self.streams.retain(|key, _| key.ring == ring);
        let dropped = before - self.streams.len();
        if dropped > 0 {
            tracing::debug!(new_ring = %ring, dropped, "discarded stale reassembly buffers on ring change");
        }
    }

    /// Feed one received `PackedFrame` in for `originator` at `msn`.
    /// Returns `Some((key, message))` once a fragmented message completes;
    /// `Batch` frames are rejected here — callers should handle those
    /// directly without going through the reassembler.
    pub fn feed(&mut self, ring: RingId, originator: NodeId, msn: Msn, frame: PackedFrame) -> Result<Option<(ReassemblyKey, PgMessage)>> {
        if let Some(current) = self.current_ring {
            if ring != current {
                return Err(PgError::StaleRing { fragment_ring: ring, current_ring: current });
            }
        }

        let key = StreamKey { ring, originator };
        match frame {
            PackedFrame::Batch(_) => Err(PgError::MalformedFrame),
            PackedFrame::FragmentStart { service, total_len, chunk } => {
                self.streams.insert(key, Partial { first_msn: msn, service, total_len, data: chunk });
                Ok(None)
            }
            PackedFrame::FragmentContinuation { chunk, last } => {
                let partial = self.streams.get_mut(&key).ok_or(PgError::UnknownFragment)?;
                partial.data.extend_from_slice(&chunk);
                if !last {
                    return Ok(None);
                }
                let partial = self.streams.remove(&key).expect("just looked up");
                if partial.data.len() as u32 != partial.total_len {
                    tracing::warn!(
                        expected = partial.total_len,
                        got = partial.data.len(),
                        "reassembled fragment length mismatch"
                    );
                }
                let reassembly_key = ReassemblyKey { ring, originator, first_msn: partial.first_msn };
                Ok(Some((reassembly_key, PgMessage { service: partial.service, body: partial.data })))
            }
        }
    }

    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::PackedMessageBuilder;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn reassembles_a_fragmented_message_end_to_end() {
        let ring = RingId::new(n(1), 1);
        let mut builder = PackedMessageBuilder::new(128);
        let payload = vec![0x5Au8; 128 * 3];
        let frames = builder.push(7, payload.clone()).expect("push");

        let mut reassembler = Reassembler::new();
        reassembler.set_current_ring(ring);
        let mut result = None;
        for (i, frame) in frames.into_iter().enumerate() {
            result = reassembler.feed(ring, n(2), Msn::new(10 + i as u32), frame).expect("feed");
        }
        let (key, message) = result.expect("completed");
        assert_eq!(key.ring, ring);
        assert_eq!(key.originator, n(2));
        assert_eq!(key.first_msn, Msn::new(10));
        assert_eq!(message.body, payload);
        assert_eq!(reassembler.pending_streams(), 0);
    }

    #[test]
    fn ring_change_drops_in_progress_streams() {
        let ring_a = RingId::new(n(1), 1);
        let ring_b = RingId::new(n(1), 2);
        let mut reassembler = Reassembler::new();
        reassembler.set_current_ring(ring_a);
        reassembler
            .feed(ring_a, n(2), Msn::new(1), PackedFrame::FragmentStart { service: 1, total_len: 10, chunk: vec![1, 2, 3] })
            .expect("feed start");
        assert_eq!(reassembler.pending_streams(), 1);

        reassembler.set_current_ring(ring_b);
        assert_eq!(reassembler.pending_streams(), 0);
    }

    #[test]
    fn continuation_for_unknown_stream_is_rejected() {
        let ring = RingId::new(n(1), 1);
        let mut reassembler = Reassembler::new();
        reassembler.set_current_ring(ring);
        let result = reassembler.feed(ring, n(2), Msn::new(5), PackedFrame::FragmentContinuation { chunk: vec![1], last: true });
        assert!(matches!(result, Err(PgError::UnknownFragment)));
    }
}
