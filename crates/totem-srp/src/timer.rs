//! Opaque timer handles.
//!
//! `SrpInstance` never owns a timer itself — owning the sleep future would
//! make the state machine self-referential, since the timer's callback
//! needs to reach back into the instance that armed it. Instead the
//! instance describes *what* it wants timed via [`TimerRequest`] and the
//! event loop (in `totem-daemon`) owns the arena of real timers, handing
//! back an opaque [`TimerId`] that the instance stores and later presents
//! on cancellation or is told about on expiry.

use serde::{Deserialize, Serialize};

/// An opaque handle into the event loop's timer arena. Carries no
/// information about what it times; `totem-srp` only ever compares handles
/// for equality to recognize its own pending timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

/// The distinct timers the protocol needs, named by role rather than by
/// duration — the event loop looks up the configured duration for each
/// kind from `DaemonConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// Token hold timer: fires if no token arrives within `token_timeout`.
    TokenLoss,
    /// Periodic MEMB_MERGE_DETECT broadcast.
    MergeDetect,
    /// Periodic MEMB_JOIN re-broadcast while in GATHER.
    JoinBroadcast,
    /// Commit-token circulation timeout.
    CommitTimeout,
    /// Interface up/down re-check interval.
    Downcheck,
}

/// What the instance wants the event loop to do with its timer arena.
/// Returned from state-machine operations instead of having the instance
/// reach into the loop directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// (Re-)arm the named timer kind, replacing any previous handle for
    /// that kind.
    Arm(TimerKind),
    /// Cancel a previously armed timer by the handle the loop gave back.
    Cancel(TimerId),
}
