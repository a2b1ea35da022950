//! The CPG service proper: client-facing operations,
//! delivery handling for the five `CpgMessage` kinds, and the
//! `totem_sync::SyncService` implementation that applies a reconciled
//! downlist as one synchronized pass of PROCLEAVE-equivalent events.

use std::collections::{BTreeMap, VecDeque};

use totem_sync::{SyncProgress, SyncService};
use totem_types::{GroupName, NodeId, RingId};

use crate::error::{CpgError, Result};
use crate::group::{ClientDescriptor, ClientState, GroupTable};
use crate::message::{CpgMessage, JoinListEntry, Pid, ProcReason, ProcessRecord};

/// Opaque handle for a local IPC client connection, assigned by the
/// daemon layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

/// Events the daemon layer drains and routes to IPC clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpgEvent {
    /// Synthetic event preceding the first real confchg after a join that
    /// requested it.
    TotemMembership { to: ClientId, group: GroupName },
    Confchg {
        to: Vec<ClientId>,
        group: GroupName,
        joined: Vec<ProcessRecord>,
        left: Vec<ProcessRecord>,
    },
    Deliver {
        to: Vec<ClientId>,
        group: GroupName,
        source: ProcessRecord,
        payload: Vec<u8>,
    },
}

/// The closed process-group service for one node.
pub struct CpgService {
    local_node: NodeId,
    groups: GroupTable,
    clients: BTreeMap<ClientId, ClientDescriptor>,
    outbound: VecDeque<CpgMessage>,
    events: VecDeque<CpgEvent>,
}

impl CpgService {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            groups: GroupTable::new(),
            clients: BTreeMap::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn drain_outbound(&mut self) -> Vec<CpgMessage> {
        self.outbound.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<CpgEvent> {
        self.events.drain(..).collect()
    }

    pub fn membership_get(&self, group: &GroupName) -> &[ProcessRecord] {
        self.groups.get(group).map(|g| g.records()).unwrap_or(&[])
    }

    pub fn local_get(&self, client: ClientId) -> Option<(&GroupName, ClientState)> {
        let d = self.clients.get(&client)?;
        Some((d.group.as_ref()?, d.state))
    }

    /// lib-join: registers the descriptor and queues a PROCJOIN for
    /// origination. The client is not a group member until its own
    /// PROCJOIN is delivered back in ring order.
    pub fn join(
        &mut self,
        client: ClientId,
        pid: Pid,
        group: GroupName,
        deliver_initial_totem_membership: bool,
    ) -> Result<()> {
        let descriptor = self.clients.entry(client).or_insert_with(|| ClientDescriptor::new(pid));
        descriptor.begin_join(group.clone(), deliver_initial_totem_membership)?;

        self.outbound.push_back(CpgMessage::ProcJoin {
            group,
            record: ProcessRecord::new(self.local_node, pid),
            reason: ProcReason::Join,
        });
        Ok(())
    }

    /// lib-leave: queues a PROCLEAVE for origination.
    pub fn leave(&mut self, client: ClientId) -> Result<()> {
        let descriptor = self.clients.get_mut(&client).ok_or(CpgError::NotJoined)?;
        let group = descriptor.group.clone().ok_or(CpgError::NotJoined)?;
        let pid = descriptor.pid;
        descriptor.begin_leave()?;

        self.outbound.push_back(CpgMessage::ProcLeave {
            group,
            record: ProcessRecord::new(self.local_node, pid),
            reason: ProcReason::Leave,
        });
        Ok(())
    }

    /// Queues an MCAST for origination; the client must currently be a
    /// member.
    pub fn mcast(&mut self, client: ClientId, payload: Vec<u8>) -> Result<()> {
        let descriptor = self.clients.get(&client).ok_or(CpgError::NotJoined)?;
        if !descriptor.receives_deliveries() {
            return Err(CpgError::NotJoined);
        }
        let group = descriptor.group.clone().ok_or(CpgError::NotJoined)?;
        let source = ProcessRecord::new(self.local_node, descriptor.pid);
        self.outbound.push_back(CpgMessage::Mcast { group, source, payload });
        Ok(())
    }

    /// Client disconnected: remove the
    /// descriptor immediately; if it held group membership, queue a
    /// synthetic PROCLEAVE. Any events already queued for this client
    /// remain undelivered by construction — the daemon drops them when
    /// the connection is gone.
    pub fn finalize(&mut self, client: ClientId) {
        let Some(descriptor) = self.clients.remove(&client) else { return };
        if descriptor.receives_deliveries() {
            if let Some(group) = descriptor.group {
                self.outbound.push_back(CpgMessage::ProcLeave {
                    group,
                    record: ProcessRecord::new(self.local_node, descriptor.pid),
                    reason: ProcReason::ProcDown,
                });
            }
        }
    }

    fn recipients(&self, group: &GroupName) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, d)| d.receives_deliveries() && d.group.as_ref() == Some(group))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Delivers one exec message in ring order.
    pub fn on_deliver(&mut self, msg: CpgMessage) {
        match msg {
            CpgMessage::ProcJoin { group, record, reason: _ } => {
                if self.groups.entry(group.clone()).insert(record) {
                    for (id, d) in self.clients.iter_mut() {
                        if d.group.as_ref() == Some(&group)
                            && d.state == ClientState::JoinStarted
                            && record.node == self.local_node
                            && d.pid == record.pid
                        {
                            if d.deliver_initial_totem_membership {
                                self.events.push_back(CpgEvent::TotemMembership { to: *id, group: group.clone() });
                            }
                            d.complete_join();
                        }
                    }
                    self.events.push_back(CpgEvent::Confchg {
                        to: self.recipients(&group),
                        group,
                        joined: vec![record],
                        left: Vec::new(),
                    });
                }
            }
            CpgMessage::ProcLeave { group, record, reason: _ } => {
                let was_member = self.groups.entry(group.clone()).remove(record);
                self.groups.prune_empty(&group);
                if was_member {
                    let to = self.recipients(&group);
                    for d in self.clients.values_mut() {
                        if d.group.as_ref() == Some(&group)
                            && record.node == self.local_node
                            && d.pid == record.pid
                            && d.state == ClientState::LeaveStarted
                        {
                            d.complete_leave();
                        }
                    }
                    self.events.push_back(CpgEvent::Confchg { to, group, joined: Vec::new(), left: vec![record] });
                }
            }
            CpgMessage::JoinList { sender, entries } => {
                for entry in entries {
                    let record = ProcessRecord::new(sender, entry.pid);
                    if self.groups.entry(entry.group.clone()).insert(record) {
                        self.events.push_back(CpgEvent::Confchg {
                            to: self.recipients(&entry.group),
                            group: entry.group,
                            joined: vec![record],
                            left: Vec::new(),
                        });
                    }
                }
            }
            CpgMessage::Mcast { group, source, payload } => {
                let known_member = self.groups.get(&group).is_some_and(|g| g.contains(source));
                if !known_member {
                    tracing::debug!(?group, node = %source.node, "dropping mcast from unknown originator");
                    return;
                }
                let to = self.recipients(&group);
                if !to.is_empty() {
                    self.events.push_back(CpgEvent::Deliver { to, group, source, payload });
                }
            }
            CpgMessage::Downlist(_) | CpgMessage::DownlistOld(_) => {
                tracing::trace!("downlist messages are consumed by the sync barrier, not ordinary delivery");
            }
        }
    }

    fn local_join_list(&self) -> Vec<JoinListEntry> {
        self.clients
            .values()
            .filter(|d| d.receives_deliveries())
            .filter_map(|d| d.group.clone().map(|group| JoinListEntry { group, pid: d.pid }))
            .collect()
    }
}

impl SyncService for CpgService {
    fn sync_init(&mut self, _trans_list: &[NodeId], _member_list: &[NodeId], _ring_id: RingId) {
        let entries = self.local_join_list();
        if !entries.is_empty() {
            self.outbound.push_back(CpgMessage::JoinList { sender: self.local_node, entries });
        }
    }

    fn sync_process(&mut self) -> SyncProgress {
        // JoinList origination happens entirely in sync_init; CPG has no
        // further per-round work before it can report done.
        SyncProgress::Done
    }

    fn sync_abort(&mut self) {
        self.outbound.clear();
    }

    fn sync_activate(&mut self) {}

    /// Applies the reconciled downlist as one synchronized pass of
    /// PROCLEAVE-equivalent events.
    fn confchg(&mut self, _joined: &[NodeId], left: &[NodeId]) {
        for group in self.groups.group_names() {
            let Some(membership) = self.groups.get(&group) else { continue };
            let departed: Vec<ProcessRecord> =
                membership.records().iter().copied().filter(|r| left.contains(&r.node)).collect();
            if departed.is_empty() {
                continue;
            }
            let to = self.recipients(&group);
            let entry = self.groups.entry(group.clone());
            for record in &departed {
                entry.remove(*record);
            }
            self.groups.prune_empty(&group);
            for d in self.clients.values_mut() {
                if d.group.as_ref() == Some(&group)
                    && departed.iter().any(|r| r.node == self.local_node && r.pid == d.pid)
                {
                    d.complete_leave();
                }
            }
            self.events.push_back(CpgEvent::Confchg { to, group, joined: Vec::new(), left: departed });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> GroupName {
        GroupName::new(name.as_bytes().to_vec()).expect("valid group")
    }

    #[test]
    fn join_then_delivery_completes_the_client_and_emits_confchg() {
        let mut svc = CpgService::new(NodeId::new(1));
        let client = ClientId(1);
        svc.join(client, Pid::new(100), group("g"), false).expect("join");

        let outbound = svc.drain_outbound();
        assert_eq!(outbound.len(), 1);
        let CpgMessage::ProcJoin { group: g, record, .. } = outbound.into_iter().next().expect("one outbound message") else {
            panic!("expected ProcJoin");
        };

        svc.on_deliver(CpgMessage::ProcJoin { group: g.clone(), record, reason: ProcReason::Join });
        assert_eq!(svc.local_get(client).expect("descriptor").1, ClientState::JoinCompleted);

        let events = svc.drain_events();
        assert!(events.iter().any(|e| matches!(e, CpgEvent::Confchg { joined, .. } if joined == &[record])));
    }

    #[test]
    fn mcast_from_unknown_originator_is_dropped() {
        let mut svc = CpgService::new(NodeId::new(1));
        let g = group("g");
        let stranger = ProcessRecord::new(NodeId::new(99), Pid::new(1));
        svc.on_deliver(CpgMessage::Mcast { group: g, source: stranger, payload: vec![1, 2, 3] });
        assert!(svc.drain_events().is_empty());
    }

    #[test]
    fn mcast_from_a_member_is_delivered_to_joined_clients() {
        let mut svc = CpgService::new(NodeId::new(1));
        let g = group("g");
        let client = ClientId(1);
        svc.join(client, Pid::new(100), g.clone(), false).expect("join");
        let record = ProcessRecord::new(NodeId::new(1), Pid::new(100));
        svc.on_deliver(CpgMessage::ProcJoin { group: g.clone(), record, reason: ProcReason::Join });
        svc.drain_events();

        svc.on_deliver(CpgMessage::Mcast { group: g, source: record, payload: vec![7] });
        let events = svc.drain_events();
        assert!(matches!(&events[..], [CpgEvent::Deliver { payload, .. }] if payload == &vec![7]));
    }

    #[test]
    fn confchg_removes_departed_node_records_in_one_pass() {
        let mut svc = CpgService::new(NodeId::new(1));
        let g = group("g");
        let remote = ProcessRecord::new(NodeId::new(2), Pid::new(1));
        svc.on_deliver(CpgMessage::ProcJoin { group: g.clone(), record: remote, reason: ProcReason::Join });
        svc.drain_events();

        svc.confchg(&[], &[NodeId::new(2)]);
        let events = svc.drain_events();
        assert!(matches!(&events[..], [CpgEvent::Confchg { left, .. }] if left == &vec![remote]));
        assert!(svc.membership_get(&g).is_empty());
    }

    #[test]
    fn disconnect_while_joined_queues_a_synthetic_procleave() {
        let mut svc = CpgService::new(NodeId::new(1));
        let g = group("g");
        let client = ClientId(1);
        svc.join(client, Pid::new(100), g.clone(), false).expect("join");
        let record = ProcessRecord::new(NodeId::new(1), Pid::new(100));
        svc.on_deliver(CpgMessage::ProcJoin { group: g, record, reason: ProcReason::Join });
        svc.drain_outbound();

        svc.finalize(client);
        let outbound = svc.drain_outbound();
        assert!(matches!(&outbound[..], [CpgMessage::ProcLeave { reason: ProcReason::ProcDown, .. }]));
        assert!(svc.local_get(client).is_none());
    }
}
