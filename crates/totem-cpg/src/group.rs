//! Per-group membership and the client descriptor state machine.

use std::collections::BTreeMap;

use totem_types::{GroupName, NodeId};

use crate::message::{Pid, ProcessRecord};

/// Records for one group, kept in insertion order for deterministic
/// iteration.
#[derive(Clone, Debug, Default)]
pub struct GroupMembership {
    records: Vec<ProcessRecord>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    /// Appends the record if absent. Returns `true` if it was newly added.
    pub fn insert(&mut self, record: ProcessRecord) -> bool {
        if self.records.contains(&record) {
            false
        } else {
            self.records.push(record);
            true
        }
    }

    /// Removes the record if present. Returns `true` if it was removed.
    pub fn remove(&mut self, record: ProcessRecord) -> bool {
        if let Some(pos) = self.records.iter().position(|r| *r == record) {
            self.records.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, record: ProcessRecord) -> bool {
        self.records.contains(&record)
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.records.iter().any(|r| r.node == node)
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All groups known to this node, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct GroupTable {
    groups: BTreeMap<GroupName, GroupMembership>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self { groups: BTreeMap::new() }
    }

    pub fn entry(&mut self, group: GroupName) -> &mut GroupMembership {
        self.groups.entry(group).or_default()
    }

    pub fn get(&self, group: &GroupName) -> Option<&GroupMembership> {
        self.groups.get(group)
    }

    /// All group names currently tracked, for iteration over the whole
    /// table.
    pub fn group_names(&self) -> Vec<GroupName> {
        self.groups.keys().cloned().collect()
    }

    /// Drops the membership table for a group once it has no records left,
    /// so an abandoned group name doesn't linger forever.
    pub fn prune_empty(&mut self, group: &GroupName) {
        if self.groups.get(group).is_some_and(GroupMembership::is_empty) {
            self.groups.remove(group);
        }
    }
}

/// State `UNJOINED | JOIN_STARTED | JOIN_COMPLETED | LEAVE_STARTED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Unjoined,
    JoinStarted,
    JoinCompleted,
    LeaveStarted,
}

/// Per-client-connection state: which group it has asked to join (or is
/// joined to), its local pid, and its place in the join/leave state
/// machine.
#[derive(Clone, Debug)]
pub struct ClientDescriptor {
    pub pid: Pid,
    pub group: Option<GroupName>,
    pub state: ClientState,
    /// Whether the next confchg delivered to this client should be
    /// preceded by a synthetic totem-membership event.
    pub deliver_initial_totem_membership: bool,
}

impl ClientDescriptor {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            group: None,
            state: ClientState::Unjoined,
            deliver_initial_totem_membership: false,
        }
    }

    /// lib-join in UNJOINED → JOIN_STARTED.
    pub fn begin_join(&mut self, group: GroupName, want_initial_totem_membership: bool) -> crate::error::Result<()> {
        if self.state != ClientState::Unjoined {
            return Err(crate::error::CpgError::JoinInProgress);
        }
        self.group = Some(group);
        self.state = ClientState::JoinStarted;
        self.deliver_initial_totem_membership = want_initial_totem_membership;
        Ok(())
    }

    /// Delivery of this client's own PROCJOIN → JOIN_COMPLETED.
    pub fn complete_join(&mut self) {
        if self.state == ClientState::JoinStarted {
            self.state = ClientState::JoinCompleted;
        }
    }

    /// lib-leave in JOIN_COMPLETED → LEAVE_STARTED.
    pub fn begin_leave(&mut self) -> crate::error::Result<()> {
        if self.state != ClientState::JoinCompleted {
            return Err(crate::error::CpgError::NotJoined);
        }
        self.state = ClientState::LeaveStarted;
        Ok(())
    }

    /// Delivery of this client's own PROCLEAVE → UNJOINED.
    pub fn complete_leave(&mut self) {
        self.state = ClientState::Unjoined;
        self.group = None;
        self.deliver_initial_totem_membership = false;
    }

    /// Whether a MCAST deliver callback is owed to this client: it must be
    /// a member of the group and either fully joined or mid-leave.
    pub fn receives_deliveries(&self) -> bool {
        matches!(self.state, ClientState::JoinCompleted | ClientState::LeaveStarted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_types::NodeId;

    fn rec(node: u32, pid: u32) -> ProcessRecord {
        ProcessRecord::new(NodeId::new(node), Pid::new(pid))
    }

    #[test]
    fn membership_dedupes_inserts_and_preserves_order() {
        let mut m = GroupMembership::new();
        assert!(m.insert(rec(1, 10)));
        assert!(m.insert(rec(2, 20)));
        assert!(!m.insert(rec(1, 10)));
        assert_eq!(m.records(), &[rec(1, 10), rec(2, 20)]);
    }

    #[test]
    fn descriptor_walks_the_full_join_leave_cycle() {
        let mut d = ClientDescriptor::new(Pid::new(1));
        let group = GroupName::new(b"g".to_vec()).expect("valid group");
        d.begin_join(group, false).expect("begin join");
        assert_eq!(d.state, ClientState::JoinStarted);

        d.complete_join();
        assert_eq!(d.state, ClientState::JoinCompleted);
        assert!(d.receives_deliveries());

        d.begin_leave().expect("begin leave");
        assert_eq!(d.state, ClientState::LeaveStarted);
        assert!(d.receives_deliveries());

        d.complete_leave();
        assert_eq!(d.state, ClientState::Unjoined);
        assert!(d.group.is_none());
    }

    #[test]
    fn cannot_join_twice_without_leaving() {
        let mut d = ClientDescriptor::new(Pid::new(1));
        let group = GroupName::new(b"g".to_vec()).expect("valid group");
        d.begin_join(group.clone(), false).expect("begin join");
        assert!(d.begin_join(group, false).is_err());
    }
}
