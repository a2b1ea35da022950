/// Errors from the sync barrier.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync_process called while the barrier is not running")]
    NotRunning,

    #[error("no downlists submitted to reconcile")]
    NoDownlists,
}

pub type Result<T> = std::result::Result<T, SyncError>;
