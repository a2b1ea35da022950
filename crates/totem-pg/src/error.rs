/// Errors from the packed-message layer.
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    #[error("message of {0} bytes has no possible frame budget (frame ceiling too small)")]
    OversizedMessage(usize),

    #[error("packed frame was truncated or malformed")]
    MalformedFrame,

    #[error("fragment continuation referenced an unknown reassembly key")]
    UnknownFragment,

    #[error("fragment belongs to ring {fragment_ring}, current ring is {current_ring}")]
    StaleRing {
        fragment_ring: totem_types::RingId,
        current_ring: totem_types::RingId,
    },
}

pub type Result<T> = std::result::Result<T, PgError>;
