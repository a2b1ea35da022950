//! The ORF (Ordering/Reliability/Flow) token.

use serde::{Deserialize, Serialize};

use totem_types::{Msn, NodeId, RingId};

/// A single outstanding retransmit request: "under ring `ring`, I am
/// missing MSN `msn`". Carrying the ring id per entry, rather than relying
/// on the token's enclosing ring id, matters during rapid membership
/// flaps: an entry raised under one ring can still be circulating after
/// the ring has moved on, so each entry needs its own explicit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtrEntry {
    pub ring: RingId,
    pub msn: Msn,
}

/// The token itself: carried hop-to-hop, never broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Ring this token is circulating under.
    pub ring: RingId,
    /// Detects redundant copies of the same rotation; only the highest
    /// value seen is acted upon.
    pub token_seq: u64,
    /// Highest MSN any node has originated this rotation.
    pub high_seq: Msn,
    /// All-received-up-to: every MSN at or below this has been received
    /// by every current member.
    pub aru: Msn,
    /// The node that last set `aru` (used to detect which member is
    /// lagging when `aru` fails to advance).
    pub aru_holder: NodeId,
    /// Forwarded-count: number of new messages originated during the
    /// rotation that is about to complete.
    pub fcc: u32,
    /// Set when this rotation carried at least one retransmission.
    pub retrans_flag: bool,
    /// Gaps observed around the ring, named by (ring, msn) rather than
    /// msn alone.
    pub rtr: Vec<RtrEntry>,
}

impl Token {
    /// A fresh token for the start of a new ring: operational traffic
    /// begins at `Msn::ZERO` with nothing outstanding.
    pub fn initial(ring: RingId, holder: NodeId) -> Self {
        Self {
            ring,
            token_seq: 0,
            high_seq: Msn::ZERO,
            aru: Msn::ZERO,
            aru_holder: holder,
            fcc: 0,
            retrans_flag: false,
            rtr: Vec::new(),
        }
    }

    /// Messages in flight this rotation: the gap between what's been
    /// originated and what's confirmed received by everyone. Used by flow
    /// control.
    pub fn in_flight(&self) -> u32 {
        self.high_seq - self.aru
    }
}

/// MEMB_JOIN: a GATHER-phase announcement of one node's view of the
/// prospective ring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembJoin {
    pub sender: NodeId,
    pub proc_list: Vec<NodeId>,
    pub failed_list: Vec<NodeId>,
    pub ring_seq: u64,
}

/// Per-address slot carried by MEMB_COMMIT_TOKEN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSlot {
    pub node: NodeId,
    pub aru: Msn,
    pub high_delivered: Msn,
    pub received_flag: bool,
}

/// MEMB_COMMIT_TOKEN: circulates exactly once during COMMIT, collecting
/// one slot per address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembCommitToken {
    pub ring: RingId,
    pub originator: NodeId,
    pub slots: Vec<CommitSlot>,
}

/// MEMB_MERGE_DETECT: periodic OPERATIONAL broadcast of one's own ring id,
/// used to notice a second ring exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembMergeDetect {
    pub sender: NodeId,
    pub ring: RingId,
}
