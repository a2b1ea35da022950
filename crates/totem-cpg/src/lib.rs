//! Closed process-group service: the representative
//! consumer of SRP, the packed-message layer, and the sync barrier.

mod error;
mod group;
mod message;
mod service;

pub use error::{CpgError, Result};
pub use group::{ClientDescriptor, ClientState, GroupMembership, GroupTable};
pub use message::{CpgMessage, JoinListEntry, Pid, ProcReason, ProcessRecord};
pub use service::{ClientId, CpgEvent, CpgService};
