//! The SRP state machine's four states.

/// `SrpInstance`'s current phase. There is no terminal state: the machine
/// is cyclic, always eventually returning to `Operational` or restarting
/// from `Gather`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrpState {
    /// Accumulating MEMB_JOIN announcements until every live member agrees
    /// on a prospective ring.
    Gather,
    /// Circulating MEMB_COMMIT_TOKEN to collect one slot per address.
    Commit,
    /// Replaying old-ring messages that some members missed.
    Recovery,
    /// Normal token-passing operation: ordering, retransmission, delivery.
    Operational,
}

impl Default for SrpState {
    fn default() -> Self {
        // Initial state is GATHER.
        Self::Gather
    }
}
