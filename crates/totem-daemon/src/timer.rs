//! The event loop's timer arena.
//!
//! `totem-srp` never owns a real timer — it only emits [`TimerAction`]s
//! describing what it wants armed or cancelled, and is later told which
//! [`TimerKind`] fired. This module is where that arena actually lives:
//! one real deadline per kind, durations sourced from [`DaemonConfig`]'s
//! five timeout constants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use totem_srp::{TimerAction, TimerId, TimerKind};

use crate::config::TimersConfig;

/// The five configured durations, resolved once at startup.
#[derive(Clone, Copy, Debug)]
pub struct TimerDurations {
    pub token_loss: Duration,
    pub merge_detect: Duration,
    pub join_broadcast: Duration,
    pub commit_timeout: Duration,
    pub downcheck: Duration,
}

impl From<&TimersConfig> for TimerDurations {
    fn from(cfg: &TimersConfig) -> Self {
        Self {
            token_loss: Duration::from_millis(cfg.token_timeout_ms),
            merge_detect: Duration::from_millis(cfg.merge_detect_period_ms),
            join_broadcast: Duration::from_millis(cfg.join_broadcast_period_ms),
            commit_timeout: Duration::from_millis(cfg.commit_token_timeout_ms),
            downcheck: Duration::from_millis(cfg.downcheck_interval_ms),
        }
    }
}

impl TimerDurations {
    fn for_kind(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::TokenLoss => self.token_loss,
            TimerKind::MergeDetect => self.merge_detect,
            TimerKind::JoinBroadcast => self.join_broadcast,
            TimerKind::CommitTimeout => self.commit_timeout,
            TimerKind::Downcheck => self.downcheck,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> TimerId {
    TimerId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// One real deadline per [`TimerKind`]. Arming a kind that's already armed
/// replaces the previous handle outright — `totem-srp` only ever needs the
/// latest arm to win, it never double-arms the same kind intentionally.
pub struct TimerArena {
    durations: TimerDurations,
    armed: HashMap<TimerKind, (TimerId, Instant)>,
}

impl TimerArena {
    pub fn new(durations: TimerDurations) -> Self {
        Self { durations, armed: HashMap::new() }
    }

    pub fn arm(&mut self, kind: TimerKind) -> TimerId {
        let id = fresh_id();
        let deadline = Instant::now() + self.durations.for_kind(kind);
        self.armed.insert(kind, (id, deadline));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.armed.retain(|_, (armed_id, _)| *armed_id != id);
    }

    /// Apply every action `totem-srp` returned from one state-machine step.
    pub fn apply_all(&mut self, actions: impl IntoIterator<Item = TimerAction>) {
        for action in actions {
            match action {
                TimerAction::Arm(kind) => {
                    self.arm(kind);
                }
                TimerAction::Cancel(id) => self.cancel(id),
            }
        }
    }

    /// The nearest deadline across every armed timer, for the event loop's
    /// `tokio::select!` to sleep until.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.values().map(|(_, deadline)| *deadline).min()
    }

    /// Every kind whose deadline has passed as of `now`, removing them from
    /// the arena (the caller re-arms periodic kinds itself).
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let expired: Vec<TimerKind> =
            self.armed.iter().filter(|(_, (_, deadline))| *deadline <= now).map(|(kind, _)| *kind).collect();
        for kind in &expired {
            self.armed.remove(kind);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durations() -> TimerDurations {
        TimerDurations {
            token_loss: Duration::from_millis(10),
            merge_detect: Duration::from_millis(20),
            join_broadcast: Duration::from_millis(30),
            commit_timeout: Duration::from_millis(40),
            downcheck: Duration::from_millis(50),
        }
    }

    #[test]
    fn arming_the_same_kind_twice_replaces_the_handle() {
        let mut arena = TimerArena::new(durations());
        let first = arena.arm(TimerKind::TokenLoss);
        let second = arena.arm(TimerKind::TokenLoss);
        assert_ne!(first, second);
        arena.cancel(first);
        // the first id no longer matches anything armed; the second still
        // does, so a deadline should still be present.
        assert!(arena.next_deadline().is_some());
    }

    #[test]
    fn next_deadline_is_the_earliest_armed() {
        let mut arena = TimerArena::new(durations());
        arena.arm(TimerKind::Downcheck);
        let merge = arena.arm(TimerKind::MergeDetect);
        let next = arena.next_deadline().expect("a deadline");
        let (_, merge_deadline) = arena.armed.get(&TimerKind::MergeDetect).copied().expect("merge armed");
        assert_eq!(next, merge_deadline);
        let _ = merge;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_timers_are_reported_once() {
        let mut arena = TimerArena::new(durations());
        arena.arm(TimerKind::TokenLoss);
        tokio::time::advance(Duration::from_millis(11)).await;
        let expired = arena.take_expired(Instant::now());
        assert_eq!(expired, vec![TimerKind::TokenLoss]);
        assert!(arena.take_expired(Instant::now()).is_empty());
    }
}
