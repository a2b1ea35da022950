//! Sync barrier and downlist reconciliation: the
//! membership-transition machinery that sits between SRP's RECOVERY state
//! and a service's resumed operational traffic.

mod barrier;
mod downlist;
mod error;

pub use barrier::{SyncBarrier, SyncProgress, SyncService};
pub use downlist::{reconcile, Downlist, DownlistOld, DownlistPhase};
pub use error::{Result, SyncError};
