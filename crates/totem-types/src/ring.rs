//! Ring identifier.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Identifies a single membership ring: the representative node that formed
/// it, and a monotonically increasing sequence number.
///
/// Two rings are equal iff both fields match. Ring sequence numbers are
/// strictly monotonic at every node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RingId {
    /// The lowest-id member of the ring at formation time.
    pub rep: NodeId,
    /// Strictly increasing across every ring this node has participated in.
    pub seq: u64,
}

impl RingId {
    pub const fn new(rep: NodeId, seq: u64) -> Self {
        Self { rep, seq }
    }

    /// The initial ring a node starts in before any membership has formed.
    pub const fn initial(self_id: NodeId) -> Self {
        Self { rep: self_id, seq: 0 }
    }

    /// The next ring in sequence, keeping the same representative.
    ///
    /// Callers forming a *new* ring (after a GATHER → COMMIT transition)
    /// should construct a fresh `RingId` with the newly computed
    /// representative instead of calling this.
    pub const fn next(self) -> Self {
        Self { rep: self.rep, seq: self.seq + 1 }
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rep, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_both_fields() {
        let a = RingId::new(NodeId::new(1), 5);
        let b = RingId::new(NodeId::new(1), 5);
        let c = RingId::new(NodeId::new(2), 5);
        let d = RingId::new(NodeId::new(1), 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn next_increments_sequence_only() {
        let a = RingId::new(NodeId::new(3), 7);
        let b = a.next();
        assert_eq!(b.rep, a.rep);
        assert_eq!(b.seq, a.seq + 1);
    }
}
