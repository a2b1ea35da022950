//! Downlist exchange and reconciliation, grounded on
//! `examples/original_source/services/cpg.c`'s
//! `CPG_DOWNLIST_WAITING_FOR_MESSAGES` / `CPG_DOWNLIST_APPLYING` state
//! pair, kept here as [`DownlistPhase`].

use serde::{Deserialize, Serialize};

use totem_types::NodeId;

use crate::error::{Result, SyncError};

/// One node's report of who it believes has left, multicast at sync
/// entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downlist {
    pub sender: NodeId,
    pub old_members_count: u32,
    pub left: Vec<NodeId>,
}

/// The legacy pre-reconciliation downlist shape. Decoded for
/// compatibility with an older participant in the cluster but never
/// originated by this implementation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlistOld {
    pub sender: NodeId,
    pub left: Vec<NodeId>,
}

impl From<DownlistOld> for Downlist {
    /// The legacy shape carried no `old_members_count`; treat it as the
    /// lowest possible priority so a current-format downlist from any
    /// other node always wins reconciliation over a legacy one.
    fn from(old: DownlistOld) -> Self {
        Downlist { sender: old.sender, old_members_count: 0, left: old.left }
    }
}

/// Mirrors `cpg_downlist_state_e` in the original source: whether this
/// node is still collecting downlists from every peer, or has chosen the
/// master list and is applying it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownlistPhase {
    WaitingForMessages,
    Applying,
}

/// Pick the master downlist deterministically: maximum
/// `old_members_count`, ties broken by lowest `sender`.
pub fn reconcile(downlists: &[Downlist]) -> Result<Downlist> {
    downlists
        .iter()
        .max_by(|a, b| {
            a.old_members_count
                .cmp(&b.old_members_count)
                .then_with(|| b.sender.cmp(&a.sender))
        })
        .cloned()
        .ok_or(SyncError::NoDownlists)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dl(sender: u32, count: u32, left: &[u32]) -> Downlist {
        Downlist {
            sender: NodeId::new(sender),
            old_members_count: count,
            left: left.iter().copied().map(NodeId::new).collect(),
        }
    }

    #[test]
    fn picks_maximum_old_members_count() {
        let lists = vec![dl(2, 3, &[5]), dl(1, 5, &[6]), dl(3, 4, &[7])];
        let chosen = reconcile(&lists).expect("reconcile");
        assert_eq!(chosen.sender, NodeId::new(1));
        assert_eq!(chosen.left, vec![NodeId::new(6)]);
    }

    #[test]
    fn ties_are_broken_by_lowest_sender() {
        let lists = vec![dl(5, 4, &[]), dl(2, 4, &[]), dl(9, 4, &[])];
        let chosen = reconcile(&lists).expect("reconcile");
        assert_eq!(chosen.sender, NodeId::new(2));
    }

    #[test]
    fn reconciliation_is_deterministic_regardless_of_input_order() {
        let forward = vec![dl(1, 5, &[]), dl(2, 5, &[]), dl(3, 1, &[])];
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(reconcile(&forward).unwrap(), reconcile(&reversed).unwrap());
    }

    #[test]
    fn legacy_downlist_decodes_and_loses_reconciliation_to_any_current_entry() {
        let legacy: Downlist = DownlistOld { sender: NodeId::new(1), left: vec![NodeId::new(9)] }.into();
        let modern = dl(2, 1, &[]);
        let chosen = reconcile(&[legacy, modern]).expect("reconcile");
        assert_eq!(chosen.sender, NodeId::new(2));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(reconcile(&[]), Err(SyncError::NoDownlists)));
    }
}
