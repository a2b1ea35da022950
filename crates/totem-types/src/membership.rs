//! Membership set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A node's view of the cluster, classified into the current ring's
/// members, nodes suspected dead ("failed"), and the processor list
/// observed in the last gather round ("proc").
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSet {
    members: BTreeSet<NodeId>,
    failed: BTreeSet<NodeId>,
    proc: BTreeSet<NodeId>,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I: IntoIterator<Item = NodeId>>(members: I) -> Self {
        Self {
            members: members.into_iter().collect(),
            failed: BTreeSet::new(),
            proc: BTreeSet::new(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn failed(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.failed.iter().copied()
    }

    pub fn proc(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.proc.iter().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn add_member(&mut self, id: NodeId) {
        self.failed.remove(&id);
        self.members.insert(id);
    }

    pub fn mark_failed(&mut self, id: NodeId) {
        self.members.remove(&id);
        self.failed.insert(id);
    }

    pub fn set_proc(&mut self, proc: BTreeSet<NodeId>) {
        self.proc = proc;
    }

    /// The lowest node id in the membership; this is the ring representative.
    pub fn representative(&self) -> Option<NodeId> {
        self.members.iter().next().copied()
    }

    /// This node's successor around the ring, for token hop-to-hop passing.
    /// A ring with exactly one member is its own successor.
    pub fn successor_of(&self, id: NodeId) -> Option<NodeId> {
        if !self.members.contains(&id) {
            return None;
        }
        let mut iter = self.members.range(id..).skip(1);
        iter.next().or_else(|| self.members.iter().next()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn representative_is_minimum_member() {
        let set = MembershipSet::with_members([n(3), n(1), n(2)]);
        assert_eq!(set.representative(), Some(n(1)));
    }

    #[test]
    fn single_member_ring_is_its_own_successor() {
        let set = MembershipSet::with_members([n(1)]);
        assert_eq!(set.successor_of(n(1)), Some(n(1)));
    }

    #[test]
    fn successor_wraps_around() {
        let set = MembershipSet::with_members([n(1), n(2), n(3)]);
        assert_eq!(set.successor_of(n(1)), Some(n(2)));
        assert_eq!(set.successor_of(n(3)), Some(n(1)));
    }

    #[test]
    fn mark_failed_removes_from_members() {
        let mut set = MembershipSet::with_members([n(1), n(2)]);
        set.mark_failed(n(2));
        assert!(!set.is_member(n(2)));
        assert!(set.failed().any(|f| f == n(2)));
    }
}
