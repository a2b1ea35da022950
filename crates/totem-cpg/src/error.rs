/// Errors from the CPG service.
#[derive(Debug, thiserror::Error)]
pub enum CpgError {
    #[error("client is not joined to a group")]
    NotJoined,

    #[error("client already has a join in progress")]
    JoinInProgress,

    #[error("client has no pending leave")]
    NotLeaving,

    #[error("outbound queue is full")]
    TryAgain,

    #[error("group name rejected: {0}")]
    InvalidGroup(#[from] totem_types::ApiError),
}

pub type Result<T> = std::result::Result<T, CpgError>;
