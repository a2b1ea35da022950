//! # totem-types
//!
//! Shared identifiers and client-facing error types for the Totem core.
//!
//! These types are used by every layer of the pipeline described in the
//! protocol specification (crypto frame, transport, the single-ring
//! protocol, the packed-message layer, the sync barrier, and CPG) so that
//! no crate has to depend on a sibling purely to share a struct.
//!
//! - [`node`] — [`NodeId`], the stable 32-bit cluster node identifier.
//! - [`ring`] — [`RingId`], the (representative, sequence) membership epoch.
//! - [`msn`] — [`Msn`], the ring-scoped message sequence number.
//! - [`membership`] — [`MembershipSet`], the members/failed/proc classification.
//! - [`group`] — [`GroupName`], opaque process-group names.
//! - [`error`] — [`ApiError`], the client-facing exit-code taxonomy.

pub mod error;
pub mod group;
pub mod membership;
pub mod msn;
pub mod node;
pub mod ring;

pub use error::{ApiError, Result};
pub use group::GroupName;
pub use membership::MembershipSet;
pub use msn::Msn;
pub use node::NodeId;
pub use ring::RingId;
