//! UDP transport for the Totem single-ring protocol: multicast with a
//! unicast token path, an operator-supplied unicast-fanout fallback for
//! networks without multicast routing, interface-change detection, and a
//! local loopback path so a node's own multicasts reach its own SRP
//! instance without depending on kernel multicast loopback.

mod fanout;
mod multicast;

pub use fanout::UnicastFanout;
pub use multicast::{Multicast, MulticastConfig};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Errors produced by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind socket at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("exhausted bind retries for {addr}")]
    BindExhausted { addr: SocketAddr },

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error("recv failed: {0}")]
    Recv(std::io::Error),

    #[error("datagram of {0} bytes exceeds the configured frame ceiling")]
    FrameTooLarge(usize),

    #[error("no unicast peers configured for fanout transport")]
    NoPeers,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A transmission-side handle shared by both transport backends: tracks
/// consecutive send failures so `totem-srp` can treat a failing link as
/// equivalent to (but distinct from) a lost token.
#[derive(Default)]
pub struct SendFailureCounter {
    consecutive: AtomicU64,
}

impl SendFailureCounter {
    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive.load(Ordering::Relaxed)
    }
}

/// The operations exposed on the transport: a low-latency
/// unicast path reserved for the token (so the token is never queued behind
/// a burst of regular multicasts), a "no flush" multicast send used while a
/// local batch of packed messages is being assembled, a "flush" send that
/// forces the batch out, and an interface-health check the event loop polls
/// on a timer.
pub trait Transport: Send + Sync {
    /// Send the token to its next-in-ring destination (or to the full
    /// membership, for transports without a concept of a point-to-point
    /// link — the receiver-side ring logic is what actually honors the
    /// token, not the transport).
    async fn token_send(&self, payload: &[u8]) -> Result<()>;

    /// Send a regular multicast datagram without forcing an immediate
    /// flush of any underlying batching (no-op for UDP, meaningful for a
    /// future batching transport — kept as a distinct entry point so
    /// callers don't need to know which).
    async fn mcast_noflush_send(&self, payload: &[u8]) -> Result<()>;

    /// Send a regular multicast datagram and force it onto the wire now.
    async fn mcast_flush_send(&self, payload: &[u8]) -> Result<()>;

    /// Re-check the bound interface/address is still usable, rebinding if
    /// the interface has come back after being down. Returns `true` if a
    /// rebind happened.
    async fn iface_check(&self) -> Result<bool>;

    /// Receive the next datagram delivered to this transport, from
    /// whichever source (multicast socket, unicast socket, or local
    /// loopback of our own send).
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Consecutive send failures observed since the last success.
    fn consecutive_send_failures(&self) -> u64;
}

/// Binds a socket with capped exponential backoff, matching the retry
/// shape `totem-daemon` uses for its own listener (see `totem-daemon`'s
/// startup sequence). Exhausting `max_attempts` is a fatal startup error.
pub(crate) async fn bind_with_retry<F, Fut, T>(
    addr: SocketAddr,
    max_attempts: u32,
    mut bind_once: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    let mut delay = std::time::Duration::from_millis(50);
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..max_attempts {
        match bind_once().await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                tracing::warn!(%addr, attempt, error = %e, "bind attempt failed");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_secs(2));
            }
        }
    }
    match last_err {
        Some(source) => Err(TransportError::Bind { addr, source }),
        None => Err(TransportError::BindExhausted { addr }),
    }
}

pub(crate) fn counter() -> Arc<SendFailureCounter> {
    Arc::new(SendFailureCounter::default())
}
