//! The sync barrier: after every membership change,
//! every registered service runs init/process/activate to completion
//! before operational traffic resumes.

use totem_types::{NodeId, RingId};

/// `sync_process`'s "call me again until done" contract, modeled as
/// explicit re-arming rather than a blocking loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncProgress {
    Done,
    TryAgain,
}

/// The dispatch interface every synchronized service implements — CPG is
/// the one concrete implementation in this repository, but the barrier
/// itself is written against any number of registered services.
pub trait SyncService {
    /// Called once at the start of a sync round with the transitional
    /// member list (old ring's survivors) and the new member list.
    fn sync_init(&mut self, trans_list: &[NodeId], member_list: &[NodeId], ring_id: RingId);

    /// Called repeatedly until it returns `Done`. May originate
    /// multicasts during this phase (ordered like operational traffic but
    /// tagged as sync traffic — handled by the caller's send path, not
    /// this trait).
    fn sync_process(&mut self) -> SyncProgress;

    /// Membership perturbed mid-sync; discard any in-progress state and
    /// wait for a fresh `sync_init`.
    fn sync_abort(&mut self);

    /// Every service reported `Done`; commit whatever `sync_process`
    /// accumulated.
    fn sync_activate(&mut self);

    /// A confchg event to deliver once the barrier (or ordinary
    /// operation) produces one.
    fn confchg(&mut self, joined: &[NodeId], left: &[NodeId]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BarrierPhase {
    Idle,
    Processing,
    Done,
}

/// Drives every registered [`SyncService`] through init, repeated
/// process-until-done, and activate. Restarts the whole barrier if
/// membership perturbs mid-sync.
pub struct SyncBarrier {
    services: Vec<Box<dyn SyncService>>,
    phase: BarrierPhase,
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self { services: Vec::new(), phase: BarrierPhase::Idle }
    }

    pub fn register(&mut self, service: Box<dyn SyncService>) {
        self.services.push(service);
    }

    pub fn is_idle(&self) -> bool {
        self.phase == BarrierPhase::Idle
    }

    /// Start a new sync round: every registered service gets `sync_init`.
    pub fn begin(&mut self, trans_list: &[NodeId], member_list: &[NodeId], ring_id: RingId) {
        tracing::info!(ring = %ring_id, services = self.services.len(), "sync barrier starting");
        for service in &mut self.services {
            service.sync_init(trans_list, member_list, ring_id);
        }
        self.phase = BarrierPhase::Processing;
    }

    /// Drive one round of `sync_process` across every service. Returns
    /// `Done` once every service has reported done (at which point
    /// `sync_activate` has already been called on all of them).
    pub fn step(&mut self) -> SyncProgress {
        if self.phase != BarrierPhase::Processing {
            return SyncProgress::Done;
        }
        let all_done = self
            .services
            .iter_mut()
            .map(|s| s.sync_process())
            .all(|p| p == SyncProgress::Done);

        if all_done {
            for service in &mut self.services {
                service.sync_activate();
            }
            self.phase = BarrierPhase::Done;
            tracing::info!("sync barrier complete, activating operational traffic");
            SyncProgress::Done
        } else {
            SyncProgress::TryAgain
        }
    }

    /// Membership perturbed mid-sync: abort every service and return to
    /// idle, ready for the caller to `begin` a fresh round.
    pub fn abort(&mut self) {
        tracing::warn!("sync barrier aborted, restarting");
        for service in &mut self.services {
            service.sync_abort();
        }
        self.phase = BarrierPhase::Idle;
    }

    /// Forward a reconciled downlist's confchg to every
    /// registered service in one synchronized pass, so the same
    /// `(joined, left)` event lands on every service in the same order it
    /// would from ordinary membership processing.
    pub fn dispatch_confchg(&mut self, joined: &[NodeId], left: &[NodeId]) {
        for service in &mut self.services {
            service.confchg(joined, left);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_types::NodeId;

    struct CountingService {
        steps_needed: u32,
        steps_taken: u32,
        activated: bool,
        aborted: bool,
    }

    impl SyncService for CountingService {
        fn sync_init(&mut self, _trans: &[NodeId], _members: &[NodeId], _ring: RingId) {
            self.steps_taken = 0;
            self.activated = false;
        }

        fn sync_process(&mut self) -> SyncProgress {
            self.steps_taken += 1;
            if self.steps_taken >= self.steps_needed {
                SyncProgress::Done
            } else {
                SyncProgress::TryAgain
            }
        }

        fn sync_abort(&mut self) {
            self.aborted = true;
        }

        fn sync_activate(&mut self) {
            self.activated = true;
        }

        fn confchg(&mut self, _joined: &[NodeId], _left: &[NodeId]) {}
    }

    fn ring() -> RingId {
        RingId::new(NodeId::new(1), 1)
    }

    #[test]
    fn barrier_waits_for_the_slowest_service() {
        let mut barrier = SyncBarrier::new();
        barrier.register(Box::new(CountingService { steps_needed: 1, steps_taken: 0, activated: false, aborted: false }));
        barrier.register(Box::new(CountingService { steps_needed: 3, steps_taken: 0, activated: false, aborted: false }));
        barrier.begin(&[], &[NodeId::new(1)], ring());

        assert_eq!(barrier.step(), SyncProgress::TryAgain);
        assert_eq!(barrier.step(), SyncProgress::TryAgain);
        assert_eq!(barrier.step(), SyncProgress::Done);
    }

    #[test]
    fn dispatch_confchg_reaches_every_registered_service() {
        struct Recording {
            left: Vec<NodeId>,
        }
        impl SyncService for Recording {
            fn sync_init(&mut self, _trans: &[NodeId], _members: &[NodeId], _ring: RingId) {}
            fn sync_process(&mut self) -> SyncProgress {
                SyncProgress::Done
            }
            fn sync_abort(&mut self) {}
            fn sync_activate(&mut self) {}
            fn confchg(&mut self, _joined: &[NodeId], left: &[NodeId]) {
                self.left = left.to_vec();
            }
        }

        let mut barrier = SyncBarrier::new();
        barrier.register(Box::new(Recording { left: Vec::new() }));
        barrier.dispatch_confchg(&[], &[NodeId::new(7)]);
        // Nothing to assert on directly since the service is boxed, but
        // this exercises the dispatch path without panicking; the
        // per-service behavior is covered by `totem-cpg`'s own tests.
    }

    #[test]
    fn abort_mid_sync_resets_to_idle_and_calls_sync_abort() {
        let mut barrier = SyncBarrier::new();
        barrier.register(Box::new(CountingService { steps_needed: 5, steps_taken: 0, activated: false, aborted: false }));
        barrier.begin(&[], &[NodeId::new(1)], ring());
        assert_eq!(barrier.step(), SyncProgress::TryAgain);

        barrier.abort();
        assert!(barrier.is_idle());
    }
}
