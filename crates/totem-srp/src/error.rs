/// Errors surfaced from the SRP state machine's public entry points.
#[derive(Debug, thiserror::Error)]
pub enum SrpError {
    #[error("token for stale ring {token_ring} while operating on {current_ring}")]
    StaleRing {
        token_ring: totem_types::RingId,
        current_ring: totem_types::RingId,
    },

    #[error("token received while not in the OPERATIONAL state")]
    NotOperational,

    #[error("commit token received while not in the COMMIT state")]
    NotInCommit,

    #[error("local node {0} is not a member of the current ring")]
    NotAMember(totem_types::NodeId),
}

pub type Result<T> = std::result::Result<T, SrpError>;
