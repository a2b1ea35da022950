//! COMMIT-phase slot table.

use totem_types::{Msn, NodeId, RingId};

use crate::token::{CommitSlot, MembCommitToken};

/// Tracks MEMB_COMMIT_TOKEN as it circulates exactly once, collecting one
/// slot per address. Only the originator needs to notice "all slots
/// filled"; every other node just writes its own slot and forwards.
#[derive(Debug, Clone)]
pub struct CommitState {
    pub ring: RingId,
    pub originator: NodeId,
    slots: Vec<CommitSlot>,
}

impl CommitState {
    /// Start a commit round for `members`, in membership order, with every
    /// slot initially unfilled.
    pub fn new(ring: RingId, originator: NodeId, members: impl IntoIterator<Item = NodeId>) -> Self {
        let slots = members
            .into_iter()
            .map(|node| CommitSlot {
                node,
                aru: Msn::ZERO,
                high_delivered: Msn::ZERO,
                received_flag: false,
            })
            .collect();
        Self { ring, originator, slots }
    }

    /// Write this node's own slot before forwarding the token onward.
    pub fn fill_slot(&mut self, node: NodeId, aru: Msn, high_delivered: Msn) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.node == node) {
            slot.aru = aru;
            slot.high_delivered = high_delivered;
            slot.received_flag = true;
        }
    }

    pub fn all_filled(&self) -> bool {
        self.slots.iter().all(|s| s.received_flag)
    }

    pub fn slots(&self) -> &[CommitSlot] {
        &self.slots
    }

    pub fn to_wire(&self) -> MembCommitToken {
        MembCommitToken {
            ring: self.ring,
            originator: self.originator,
            slots: self.slots.clone(),
        }
    }

    pub fn from_wire(token: MembCommitToken) -> Self {
        Self {
            ring: token.ring,
            originator: token.originator,
            slots: token.slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn all_filled_is_false_until_every_slot_has_received_flag() {
        let ring = RingId::new(n(1), 2);
        let mut commit = CommitState::new(ring, n(1), [n(1), n(2), n(3)]);
        assert!(!commit.all_filled());
        commit.fill_slot(n(1), Msn::new(5), Msn::new(5));
        commit.fill_slot(n(2), Msn::new(5), Msn::new(5));
        assert!(!commit.all_filled());
        commit.fill_slot(n(3), Msn::new(4), Msn::new(4));
        assert!(commit.all_filled());
    }

    #[test]
    fn wire_round_trip_preserves_slots() {
        let ring = RingId::new(n(1), 2);
        let mut commit = CommitState::new(ring, n(1), [n(1), n(2)]);
        commit.fill_slot(n(1), Msn::new(3), Msn::new(3));
        let wire = commit.to_wire();
        let restored = CommitState::from_wire(wire);
        assert_eq!(restored.slots(), commit.slots());
    }
}
