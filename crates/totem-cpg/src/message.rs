//! Wire messages carried as `totem-pg` service bodies,
//! grounded on the five `cpg_message_req_types` in
//! `examples/original_source/services/cpg.c`.

use serde::{Deserialize, Serialize};

use totem_sync::{Downlist, DownlistOld};
use totem_types::{GroupName, NodeId};

/// A client-local process id, opaque beyond equality and ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl Pid {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Mirrors the `CONFCHG_CPG_REASON_*` constants in the original source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcReason {
    Join,
    Leave,
    NodeUp,
    NodeDown,
    ProcDown,
}

/// One (group, node, pid) process-group record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub node: NodeId,
    pub pid: Pid,
}

impl ProcessRecord {
    pub const fn new(node: NodeId, pid: Pid) -> Self {
        Self { node, pid }
    }
}

/// One locally-hosted record advertised in a `JoinList` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinListEntry {
    pub group: GroupName,
    pub pid: Pid,
}

/// The exec-message kinds CPG delivers through SRP,
/// serialized as a `totem_pg::PgMessage` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpgMessage {
    ProcJoin { group: GroupName, record: ProcessRecord, reason: ProcReason },
    ProcLeave { group: GroupName, record: ProcessRecord, reason: ProcReason },
    JoinList { sender: NodeId, entries: Vec<JoinListEntry> },
    Mcast { group: GroupName, source: ProcessRecord, payload: Vec<u8> },
    Downlist(Downlist),
    /// Decode-only compatibility with a pre-reconciliation peer; this
    /// implementation never originates it.
    DownlistOld(DownlistOld),
}
