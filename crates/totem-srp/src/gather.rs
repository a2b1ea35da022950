//! GATHER-phase membership convergence.

use std::collections::BTreeMap;

use totem_types::{MembershipSet, NodeId, RingId};

use crate::token::MembJoin;

/// Accumulates per-node `MembJoin` announcements until every live member
/// of the prospective ring has reported an identical view.
#[derive(Debug, Default)]
pub struct GatherState {
    heard: BTreeMap<NodeId, MembJoin>,
}

impl GatherState {
    pub fn new() -> Self {
        Self { heard: BTreeMap::new() }
    }

    /// Record (or replace) a node's announced view. A node rebroadcasts
    /// its join whenever its view changes, so a later announcement from
    /// the same sender simply overwrites the earlier one.
    pub fn record(&mut self, join: MembJoin) {
        self.heard.insert(join.sender, join);
    }

    pub fn heard_from(&self, node: NodeId) -> bool {
        self.heard.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.heard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heard.is_empty()
    }

    /// Convergence rule: every member of `proc_list \ failed_list` has
    /// been heard from with an identical `(proc_list, failed_list)`. If
    /// convergence holds, returns the new ring that should be committed.
    pub fn converged(&self) -> Option<ConvergedRing> {
        let any = self.heard.values().next()?;
        let proc_list = &any.proc_list;
        let failed_list = &any.failed_list;

        let required: Vec<NodeId> = proc_list
            .iter()
            .copied()
            .filter(|n| !failed_list.contains(n))
            .collect();

        for node in &required {
            match self.heard.get(node) {
                Some(join) if &join.proc_list == proc_list && &join.failed_list == failed_list => {}
                _ => return None,
            }
        }

        let representative = *proc_list.iter().min()?;
        let new_seq = self.heard.values().map(|j| j.ring_seq).max()? + 1;

        Some(ConvergedRing {
            ring: RingId::new(representative, new_seq),
            members: MembershipSet::with_members(proc_list.iter().copied()),
        })
    }
}

/// The ring a converged GATHER phase agrees to commit to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergedRing {
    pub ring: RingId,
    pub members: MembershipSet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_types::NodeId;

    fn join(sender: u32, proc: &[u32], failed: &[u32], seq: u64) -> MembJoin {
        MembJoin {
            sender: NodeId::new(sender),
            proc_list: proc.iter().copied().map(NodeId::new).collect(),
            failed_list: failed.iter().copied().map(NodeId::new).collect(),
            ring_seq: seq,
        }
    }

    #[test]
    fn does_not_converge_until_every_live_member_heard_from() {
        let mut gather = GatherState::new();
        gather.record(join(1, &[1, 2, 3], &[], 5));
        assert!(gather.converged().is_none());
        gather.record(join(2, &[1, 2, 3], &[], 5));
        assert!(gather.converged().is_none());
    }

    #[test]
    fn converges_when_every_live_member_agrees() {
        let mut gather = GatherState::new();
        gather.record(join(1, &[1, 2, 3], &[], 5));
        gather.record(join(2, &[1, 2, 3], &[], 5));
        gather.record(join(3, &[1, 2, 3], &[], 5));

        let converged = gather.converged().expect("should converge");
        assert_eq!(converged.ring.rep, NodeId::new(1));
        assert_eq!(converged.ring.seq, 6);
        assert!(converged.members.is_member(NodeId::new(1)));
        assert!(converged.members.is_member(NodeId::new(3)));
    }

    #[test]
    fn failed_members_are_excluded_from_the_required_set() {
        let mut gather = GatherState::new();
        gather.record(join(1, &[1, 2, 3], &[3], 5));
        gather.record(join(2, &[1, 2, 3], &[3], 5));
        // node 3 never reports in; it's failed, so that's fine.
        let converged = gather.converged().expect("should converge without node 3");
        assert_eq!(converged.ring.rep, NodeId::new(1));
    }

    #[test]
    fn disagreeing_view_blocks_convergence() {
        let mut gather = GatherState::new();
        gather.record(join(1, &[1, 2, 3], &[], 5));
        gather.record(join(2, &[1, 2], &[], 5));
        assert!(gather.converged().is_none());
    }
}
