//! `SrpInstance`: one node's view of the single-ring protocol.

use std::collections::BTreeMap;

use totem_types::{MembershipSet, Msn, NodeId, RingId};

use crate::commit::CommitState;
use crate::error::{Result, SrpError};
use crate::gather::GatherState;
use crate::recovery::RecoveryState;
use crate::state::SrpState;
use crate::timer::{TimerAction, TimerKind};
use crate::token::{MembCommitToken, MembJoin, MembMergeDetect, RtrEntry, Token};

/// A message held in the regular received-messages buffer: the payload
/// plus enough metadata to deliver it in order and eventually prune it
/// once every local service has dispatched it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub originator: NodeId,
    pub payload: Vec<u8>,
    /// Set once every registered service has acknowledged delivery
    /// (`totem-pg`'s delivery callback completing); only then may this
    /// slot be pruned after ARU passes it.
    pub dispatched: bool,
}

/// Everything `handle_token`'s seven steps need to report back to the
/// caller in one pass: what to deliver to upper layers, what to put back
/// on the wire, and the token to hand to the successor.
#[derive(Debug, Default)]
pub struct TokenHandlingOutcome {
    /// Newly in-order deliveries this rotation made possible.
    pub delivered: Vec<(Msn, NodeId, Vec<u8>)>,
    /// Messages re-broadcast to satisfy rtr entries we can fulfill.
    pub rebroadcasts: Vec<(Msn, NodeId, Vec<u8>)>,
    /// New messages this node originated this rotation.
    pub originated: Vec<(Msn, NodeId, Vec<u8>)>,
    /// The token to forward to our successor (`None` if the token was a
    /// stale-ring or duplicate-sequence copy and was simply dropped).
    pub forward_token: Option<Token>,
    pub timer_actions: Vec<TimerAction>,
}

/// One node's complete view of the single-ring protocol: state, ring
/// identity, membership, the token (while we hold it), the received
/// buffer, and the in-progress gather/commit/recovery sub-state.
pub struct SrpInstance {
    pub self_id: NodeId,
    pub state: SrpState,
    pub ring: RingId,
    pub prev_ring: Option<RingId>,
    pub membership: MembershipSet,

    /// Flow-control window: the configured ceiling on new MSNs a holder
    /// may originate per rotation.
    pub window: u32,
    /// Consecutive crypto-authentication failures; crossing
    /// `crypto_reject_threshold` forces GATHER.
    pub crypto_reject_streak: u32,
    pub crypto_reject_threshold: u32,
    pub auth_failures: u64,

    last_token_seq: u64,
    received: BTreeMap<Msn, ReceivedMessage>,
    outbound_queue: Vec<Vec<u8>>,

    gather: Option<GatherState>,
    commit: Option<CommitState>,
    recovery: Option<RecoveryState>,
}

impl SrpInstance {
    pub fn new(self_id: NodeId, window: u32, crypto_reject_threshold: u32) -> Self {
        Self {
            self_id,
            state: SrpState::Gather,
            ring: RingId::initial(self_id),
            prev_ring: None,
            membership: MembershipSet::with_members([self_id]),
            window,
            crypto_reject_streak: 0,
            crypto_reject_threshold,
            auth_failures: 0,
            last_token_seq: 0,
            received: BTreeMap::new(),
            outbound_queue: Vec::new(),
            gather: None,
            commit: None,
            recovery: None,
        }
    }

    /// Queue a payload this node wants to originate the next time it holds
    /// the token. Flow control decides how many of
    /// these are actually sent per rotation.
    pub fn queue_send(&mut self, payload: Vec<u8>) {
        self.outbound_queue.push(payload);
    }

    pub fn local_aru(&self) -> Msn {
        // The highest MSN below which every prior MSN is present in the
        // received buffer; a gap anywhere below `high_seq` caps it.
        let mut aru = Msn::ZERO;
        let mut expect = Msn::FIRST;
        for (&msn, _) in self.received.iter() {
            if msn == expect {
                aru = msn;
                expect = expect.succ();
            } else if msn > expect {
                break;
            }
        }
        aru
    }

    fn local_gaps(&self, up_to: Msn) -> Vec<Msn> {
        let mut gaps = Vec::new();
        let mut m = Msn::FIRST;
        while m <= up_to {
            if !self.received.contains_key(&m) {
                gaps.push(m);
            }
            m = m.succ();
        }
        gaps
    }

    // ---- OPERATIONAL: token handling -----------------------------------

    /// Entry point for a received token. Returns `Ok(None)` for a
    /// duplicate or stale-ring token, which is silently (but cheaply)
    /// dropped rather than an error — receiving two copies of the same
    /// token-sequence must be idempotent.
    pub fn on_token_received(&mut self, token: Token) -> Result<Option<TokenHandlingOutcome>> {
        if self.state != SrpState::Operational {
            return Err(SrpError::NotOperational);
        }

        // Step 1: validate ring id; drop if stale.
        if token.ring != self.ring {
            tracing::debug!(token_ring = %token.ring, current_ring = %self.ring, "dropping token for stale ring");
            return Ok(None);
        }

        // Duplicate-sequence suppression: only the highest token_seq seen
        // is acted upon.
        if token.token_seq <= self.last_token_seq && token.token_seq != 0 {
            tracing::debug!(token_seq = token.token_seq, last = self.last_token_seq, "dropping duplicate token copy");
            return Ok(None);
        }
        self.last_token_seq = token.token_seq;

        let mut token = token;
        let mut outcome = TokenHandlingOutcome::default();

        // Step 2: fulfill retransmit requests we can satisfy.
        self.step_fulfill_rtr(&token, &mut outcome);

        // Step 3: deliver in-order messages now contiguous up to high_seq.
        self.step_deliver_contiguous(&token, &mut outcome);

        // Step 4: originate new messages, bounded by flow control.
        self.step_originate(&mut token, &mut outcome);

        // Step 5: reconcile ARU.
        self.step_reconcile_aru(&mut token);

        // Step 6: append rtr entries for local gaps.
        self.step_append_rtr(&mut token);

        // Step 7: hand off to the successor.
        outcome.forward_token = Some(token);
        Ok(Some(outcome))
    }

    fn step_fulfill_rtr(&self, token: &Token, outcome: &mut TokenHandlingOutcome) {
        for entry in &token.rtr {
            if entry.ring != self.ring {
                // rtr entries are checked against their own named ring,
                // never inferred from the enclosing token's ring —
                // stale entries from a prior ring must not be acted on.
                continue;
            }
            if let Some(msg) = self.received.get(&entry.msn) {
                outcome.rebroadcasts.push((entry.msn, msg.originator, msg.payload.clone()));
            }
        }
    }

    fn step_deliver_contiguous(&mut self, token: &Token, outcome: &mut TokenHandlingOutcome) {
        let mut next = self.local_aru().succ();
        while next <= token.high_seq {
            match self.received.get(&next) {
                Some(msg) if !msg.dispatched => {
                    outcome.delivered.push((next, msg.originator, msg.payload.clone()));
                }
                _ => {}
            }
            if !self.received.contains_key(&next) {
                break;
            }
            next = next.succ();
        }
    }

    fn step_originate(&mut self, token: &mut Token, outcome: &mut TokenHandlingOutcome) {
        let in_flight = token.in_flight();
        let budget = self.window.saturating_sub(in_flight);
        let to_send: Vec<Vec<u8>> = self
            .outbound_queue
            .drain(..self.outbound_queue.len().min(budget as usize))
            .collect();

        token.fcc = to_send.len() as u32;
        for payload in to_send {
            token.high_seq = token.high_seq.succ();
            let msn = token.high_seq;
            self.received.insert(
                msn,
                ReceivedMessage { originator: self.self_id, payload: payload.clone(), dispatched: false },
            );
            outcome.originated.push((msn, self.self_id, payload));
        }
    }

    fn step_reconcile_aru(&mut self, token: &mut Token) {
        // Whether we're dragging the token's ARU down because we're
        // lagging, or advancing it because we've caught up further than
        // anyone before us, either way we become the holder of record.
        let local = self.local_aru();
        if local != token.aru {
            token.aru = local;
            token.aru_holder = self.self_id;
        }
    }

    fn step_append_rtr(&mut self, token: &mut Token) {
        token.retrans_flag = false;
        let gaps = self.local_gaps(token.high_seq);
        for gap in gaps {
            let already_listed = token.rtr.iter().any(|e| e.ring == self.ring && e.msn == gap);
            if !already_listed {
                token.rtr.push(RtrEntry { ring: self.ring, msn: gap });
            }
        }
        // Entries confirmed delivered by ARU no longer need to circulate.
        token.rtr.retain(|e| e.ring != self.ring || e.msn > token.aru);
        if !token.rtr.is_empty() {
            token.retrans_flag = true;
        }
    }

    /// Accept a message delivered by a rebroadcast or original send into
    /// the local received buffer (used by the transport/pg layer feeding
    /// data back into SRP outside of token handling, and by tests).
    pub fn accept_received(&mut self, msn: Msn, originator: NodeId, payload: Vec<u8>) {
        self.received.entry(msn).or_insert(ReceivedMessage { originator, payload, dispatched: false });
    }

    /// Mark a delivered MSN as dispatched by every local service, allowing
    /// it to be pruned once ARU passes it.
    pub fn mark_dispatched(&mut self, msn: Msn) {
        if let Some(msg) = self.received.get_mut(&msn) {
            msg.dispatched = true;
        }
    }

    /// Drop received-buffer entries at or below `aru` once they are
    /// dispatched, bounding memory use.
    pub fn prune_dispatched(&mut self, aru: Msn) {
        self.received.retain(|&msn, msg| msn > aru || !msg.dispatched);
    }

    // ---- transitions ----------------------------------------------------

    /// Token hold-timer expiry: the single most common trigger of
    /// membership change.
    pub fn on_token_lost(&mut self) -> Vec<TimerAction> {
        tracing::warn!(ring = %self.ring, "token lost, moving to GATHER");
        self.state = SrpState::Gather;
        self.gather = Some(GatherState::new());
        vec![TimerAction::Arm(TimerKind::JoinBroadcast)]
    }

    /// Record a MEMB_JOIN announcement and check for convergence. Returns
    /// `Some(commit_state)` if every live member now agrees, at which
    /// point the caller transitions to COMMIT and broadcasts
    /// MEMB_COMMIT_TOKEN if this node is the new representative.
    pub fn on_memb_join(&mut self, join: MembJoin) -> Option<CommitState> {
        if self.state != SrpState::Gather {
            self.state = SrpState::Gather;
            self.gather = Some(GatherState::new());
        }
        let gather = self.gather.get_or_insert_with(GatherState::new);
        gather.record(join);

        let converged = gather.converged()?;
        self.state = SrpState::Commit;
        self.prev_ring = Some(self.ring);
        self.ring = converged.ring;
        self.membership = converged.members.clone();

        let originator = converged.ring.rep;
        Some(CommitState::new(converged.ring, originator, converged.members.members()))
    }

    /// Process an incoming MEMB_COMMIT_TOKEN: fill our own slot and report
    /// whether every slot is now filled (only meaningful at the
    /// originator).
    pub fn on_memb_commit_token(&mut self, wire: MembCommitToken) -> Result<RecoveryTransition> {
        if self.state != SrpState::Commit {
            return Err(SrpError::NotInCommit);
        }
        let mut commit = CommitState::from_wire(wire);
        commit.fill_slot(self.self_id, self.local_aru(), self.local_aru());

        if commit.all_filled() && commit.originator == self.self_id {
            self.state = SrpState::Recovery;
            let old_ring = self.prev_ring.unwrap_or(commit.ring);
            let recovery = RecoveryState::from_commit_slots(old_ring, commit.slots());
            self.recovery = Some(recovery.clone());
            return Ok(RecoveryTransition::Begin(recovery));
        }

        self.commit = Some(commit.clone());
        Ok(RecoveryTransition::Forward(commit.to_wire()))
    }

    /// Mark recovery complete for a peer once its replay range has been
    /// redelivered; when every peer is caught up, the caller should run
    /// the sync barrier and return to OPERATIONAL.
    pub fn on_recovery_delivered(&mut self, peer: NodeId) -> bool {
        if let Some(recovery) = self.recovery.as_mut() {
            recovery.mark_delivered(peer);
            recovery.is_complete()
        } else {
            true
        }
    }

    /// Recovery has finished and the sync barrier has run: resume normal
    /// token-passing operation.
    pub fn on_recovery_complete(&mut self) {
        self.state = SrpState::Operational;
        self.recovery = None;
        self.commit = None;
        self.gather = None;
        self.last_token_seq = 0;
    }

    /// Receiving a MEMB_MERGE_DETECT naming a different ring reveals a
    /// second ring exists; move to GATHER.
    pub fn on_merge_detect(&mut self, detect: MembMergeDetect) -> bool {
        if detect.ring == self.ring {
            return false;
        }
        tracing::info!(ours = %self.ring, theirs = %detect.ring, "merge detected, moving to GATHER");
        self.state = SrpState::Gather;
        self.gather = Some(GatherState::new());
        true
    }

    /// A crypto-authentication failure occurred on a received frame.
    /// Crossing the configured threshold of *consecutive* failures forces
    /// GATHER, treating the sustained rejection burst as self-isolation.
    pub fn on_crypto_reject(&mut self) -> bool {
        self.auth_failures += 1;
        self.crypto_reject_streak += 1;
        if self.crypto_reject_streak >= self.crypto_reject_threshold {
            tracing::warn!(streak = self.crypto_reject_streak, "crypto reject threshold crossed, moving to GATHER");
            self.state = SrpState::Gather;
            self.gather = Some(GatherState::new());
            self.crypto_reject_streak = 0;
            return true;
        }
        false
    }

    /// A frame authenticated successfully; resets the consecutive-reject
    /// streak (only a *consecutive* burst should force isolation).
    pub fn on_crypto_accept(&mut self) {
        self.crypto_reject_streak = 0;
    }
}

/// What happened as a result of processing an incoming commit token.
#[derive(Debug)]
pub enum RecoveryTransition {
    /// Not every slot is filled yet; forward the token onward.
    Forward(MembCommitToken),
    /// Every slot is filled and this node is the originator: recovery
    /// begins with this replay plan.
    Begin(RecoveryState),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    fn operational_instance(id: u32, ring: RingId, members: &[u32]) -> SrpInstance {
        let mut inst = SrpInstance::new(n(id), 50, 5);
        inst.state = SrpState::Operational;
        inst.ring = ring;
        inst.membership = MembershipSet::with_members(members.iter().copied().map(NodeId::new));
        inst
    }

    #[test]
    fn duplicate_token_sequence_is_idempotent() {
        let ring = RingId::new(n(1), 1);
        let mut inst = operational_instance(1, ring, &[1, 2, 3]);
        inst.queue_send(b"hello".to_vec());

        let token = Token::initial(ring, n(1));
        let mut token_with_seq = token.clone();
        token_with_seq.token_seq = 1;

        let first = inst.on_token_received(token_with_seq.clone()).expect("ok").expect("some");
        assert_eq!(first.originated.len(), 1);

        // Receiving the exact same token sequence again must be a no-op.
        let second = inst.on_token_received(token_with_seq).expect("ok");
        assert!(second.is_none());
    }

    #[test]
    fn stale_ring_token_is_dropped() {
        let ring = RingId::new(n(1), 2);
        let mut inst = operational_instance(1, ring, &[1, 2]);
        let stale = Token::initial(RingId::new(n(1), 1), n(1));
        assert!(inst.on_token_received(stale).expect("ok").is_none());
    }

    #[test]
    fn flow_control_caps_originated_messages_per_rotation() {
        let ring = RingId::new(n(1), 1);
        let mut inst = SrpInstance::new(n(1), 2, 5);
        inst.state = SrpState::Operational;
        inst.ring = ring;
        inst.membership = MembershipSet::with_members([n(1)]);
        for i in 0..5 {
            inst.queue_send(vec![i]);
        }
        let mut token = Token::initial(ring, n(1));
        token.token_seq = 1;
        let outcome = inst.on_token_received(token).expect("ok").expect("some");
        assert_eq!(outcome.originated.len(), 2, "window of 2 should cap this rotation");
    }

    #[test]
    fn aru_advances_to_local_contiguous_high_water_mark() {
        let ring = RingId::new(n(1), 1);
        let mut inst = operational_instance(1, ring, &[1]);
        inst.accept_received(Msn::new(1), n(1), vec![1]);
        inst.accept_received(Msn::new(2), n(1), vec![2]);
        assert_eq!(inst.local_aru(), Msn::new(2));
        // A gap at 3 stops further advancement even though 4 is present.
        inst.accept_received(Msn::new(4), n(1), vec![4]);
        assert_eq!(inst.local_aru(), Msn::new(2));
    }

    #[test]
    fn gather_convergence_transitions_to_commit_with_min_id_representative() {
        let mut inst = SrpInstance::new(n(2), 50, 5);
        inst.on_memb_join(MembJoin { sender: n(1), proc_list: vec![n(1), n(2), n(3)], failed_list: vec![], ring_seq: 4 });
        inst.on_memb_join(MembJoin { sender: n(3), proc_list: vec![n(1), n(2), n(3)], failed_list: vec![], ring_seq: 4 });
        let commit = inst
            .on_memb_join(MembJoin { sender: n(2), proc_list: vec![n(1), n(2), n(3)], failed_list: vec![], ring_seq: 4 })
            .expect("should converge on third join");
        assert_eq!(commit.ring.rep, n(1));
        assert_eq!(inst.state, SrpState::Commit);
    }

    #[test]
    fn merge_detect_with_matching_ring_is_a_no_op() {
        let ring = RingId::new(n(1), 1);
        let mut inst = operational_instance(1, ring, &[1, 2]);
        let moved = inst.on_merge_detect(MembMergeDetect { sender: n(2), ring });
        assert!(!moved);
        assert_eq!(inst.state, SrpState::Operational);
    }

    #[test]
    fn merge_detect_with_different_ring_forces_gather() {
        let ring = RingId::new(n(1), 1);
        let mut inst = operational_instance(1, ring, &[1, 2]);
        let other = RingId::new(n(3), 9);
        let moved = inst.on_merge_detect(MembMergeDetect { sender: n(3), ring: other });
        assert!(moved);
        assert_eq!(inst.state, SrpState::Gather);
    }

    #[test]
    fn crypto_reject_threshold_forces_gather_only_after_consecutive_bursts() {
        let ring = RingId::new(n(1), 1);
        let mut inst = operational_instance(1, ring, &[1, 2]);
        inst.crypto_reject_threshold = 3;
        assert!(!inst.on_crypto_reject());
        inst.on_crypto_accept();
        assert!(!inst.on_crypto_reject());
        assert!(!inst.on_crypto_reject());
        assert!(inst.on_crypto_reject());
        assert_eq!(inst.state, SrpState::Gather);
        assert_eq!(inst.auth_failures, 3);
    }

    #[test]
    fn single_member_ring_forwards_token_to_itself() {
        let ring = RingId::new(n(1), 1);
        let mut inst = operational_instance(1, ring, &[1]);
        assert_eq!(inst.membership.successor_of(n(1)), Some(n(1)));
        inst.queue_send(b"solo".to_vec());
        let mut token = Token::initial(ring, n(1));
        token.token_seq = 1;
        let outcome = inst.on_token_received(token).expect("ok").expect("some");
        assert_eq!(outcome.originated.len(), 1);
    }
}
