//! RECOVERY-phase replay planning.

use std::collections::BTreeMap;

use totem_types::{Msn, NodeId, RingId};

use crate::token::CommitSlot;

/// What a single peer still needs replayed, scoped to the *old* ring: the
/// half-open MSN range `(aru, high_delivered]` it was missing when the
/// commit token's slot table was filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRange {
    pub peer: NodeId,
    pub old_ring: RingId,
    pub from_exclusive: Msn,
    pub to_inclusive: Msn,
}

/// Computes, from a filled commit slot table, the set of (old_ring, MSN
/// range) each peer still needs, and tracks which of those peers has since
/// confirmed receipt.
#[derive(Debug, Clone)]
pub struct RecoveryState {
    old_ring: RingId,
    pending: BTreeMap<NodeId, ReplayRange>,
}

impl RecoveryState {
    /// Build the replay plan from the commit slots: any peer whose
    /// `high_delivered` in the old ring falls short of the furthest slot's
    /// `high_delivered` has a gap to fill.
    pub fn from_commit_slots(old_ring: RingId, slots: &[CommitSlot]) -> Self {
        let max_delivered = slots.iter().map(|s| s.high_delivered).max().unwrap_or(Msn::ZERO);

        let pending = slots
            .iter()
            .filter(|slot| slot.high_delivered < max_delivered)
            .map(|slot| {
                (
                    slot.node,
                    ReplayRange {
                        peer: slot.node,
                        old_ring,
                        from_exclusive: slot.high_delivered,
                        to_inclusive: max_delivered,
                    },
                )
            })
            .collect();

        Self { old_ring, pending }
    }

    pub fn old_ring(&self) -> RingId {
        self.old_ring
    }

    pub fn pending_ranges(&self) -> impl Iterator<Item = &ReplayRange> {
        self.pending.values()
    }

    /// Mark that `peer` has now received everything in its range. Recovery
    /// is complete once every peer that had a gap has been marked.
    pub fn mark_delivered(&mut self, peer: NodeId) {
        self.pending.remove(&peer);
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(node: u32, high_delivered: u32) -> CommitSlot {
        CommitSlot {
            node: NodeId::new(node),
            aru: Msn::new(high_delivered),
            high_delivered: Msn::new(high_delivered),
            received_flag: true,
        }
    }

    #[test]
    fn peers_at_the_max_have_nothing_pending() {
        let old_ring = RingId::new(NodeId::new(1), 3);
        let slots = vec![slot(1, 10), slot(2, 10)];
        let recovery = RecoveryState::from_commit_slots(old_ring, &slots);
        assert!(recovery.is_complete());
    }

    #[test]
    fn lagging_peer_gets_a_replay_range() {
        let old_ring = RingId::new(NodeId::new(1), 3);
        let slots = vec![slot(1, 10), slot(2, 7)];
        let mut recovery = RecoveryState::from_commit_slots(old_ring, &slots);
        assert!(!recovery.is_complete());
        let range = recovery.pending_ranges().next().expect("one pending range");
        assert_eq!(range.peer, NodeId::new(2));
        assert_eq!(range.from_exclusive, Msn::new(7));
        assert_eq!(range.to_inclusive, Msn::new(10));

        recovery.mark_delivered(NodeId::new(2));
        assert!(recovery.is_complete());
    }
}
