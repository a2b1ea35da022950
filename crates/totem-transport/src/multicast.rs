//! IP multicast transport backend.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::{bind_with_retry, counter, Result, SendFailureCounter, Transport, TransportError};

const MAX_DATAGRAM: usize = 65_507;
const BIND_RETRY_ATTEMPTS: u32 = 8;

/// Static configuration for the multicast backend.
#[derive(Clone, Debug)]
pub struct MulticastConfig {
    /// Local interface address to bind and to join the group from.
    pub iface_addr: Ipv4Addr,
    /// Multicast group address, e.g. `226.94.1.1` (corosync's historical
    /// default totem mcastaddr range).
    pub mcast_addr: Ipv4Addr,
    /// UDP port shared by the mcast and token sockets.
    pub port: u16,
}

/// One multicast-group member's transport: a receive socket joined to the
/// group, a send socket for multicasts, a dedicated unicast socket for the
/// token (so the token is never queued behind a batch of regular
/// multicasts on the same socket buffer), and a `UnixDatagram` pair used to
/// deliver the node's own sends back to itself without relying on kernel
/// multicast loopback.
pub struct Multicast {
    config: MulticastConfig,
    mcast_socket: Mutex<UdpSocket>,
    token_socket: UdpSocket,
    loopback_tx: tokio::net::UnixDatagram,
    loopback_rx: tokio::net::UnixDatagram,
    mcast_target: SocketAddr,
    token_target: Mutex<SocketAddr>,
    iface_up: AtomicBool,
    failures: Arc<SendFailureCounter>,
}

impl Multicast {
    /// Bind both sockets, join the multicast group, and set up the local
    /// loopback pair. `token_target` is the initial next-in-ring address;
    /// it is updated by the SRP layer as ring membership changes (the
    /// transport does not interpret ring structure itself).
    pub async fn bind(config: MulticastConfig, token_target: SocketAddr) -> Result<Self> {
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));

        let mcast_socket = bind_with_retry(bind_addr, BIND_RETRY_ATTEMPTS, || async {
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.set_broadcast(true).ok();
            socket.join_multicast_v4(config.mcast_addr, config.iface_addr)?;
            Ok(socket)
        })
        .await?;

        let token_bind_addr = SocketAddr::V4(SocketAddrV4::new(config.iface_addr, 0));
        let token_socket = bind_with_retry(token_bind_addr, BIND_RETRY_ATTEMPTS, || async {
            UdpSocket::bind(token_bind_addr).await
        })
        .await?;

        let (loopback_tx, loopback_rx) = tokio::net::UnixDatagram::pair()
            .map_err(TransportError::Send)?;

        let mcast_target = SocketAddr::V4(SocketAddrV4::new(config.mcast_addr, config.port));

        tracing::info!(
            iface = %config.iface_addr,
            mcast = %config.mcast_addr,
            port = config.port,
            "multicast transport bound"
        );

        Ok(Self {
            config,
            mcast_socket: Mutex::new(mcast_socket),
            token_socket,
            loopback_tx,
            loopback_rx,
            mcast_target,
            token_target: Mutex::new(token_target),
            iface_up: AtomicBool::new(true),
            failures: counter(),
        })
    }

    /// Update the unicast destination the token is sent to. Called by the
    /// SRP layer whenever the ring's successor relationship changes.
    pub async fn set_token_target(&self, target: SocketAddr) {
        *self.token_target.lock().await = target;
    }

    async fn deliver_to_self(&self, payload: &[u8]) -> Result<()> {
        self.loopback_tx
            .send(payload)
            .await
            .map(|_| ())
            .map_err(TransportError::Send)
    }
}

impl Transport for Multicast {
    async fn token_send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        let target = *self.token_target.lock().await;
        match self.token_socket.send_to(payload, target).await {
            Ok(_) => {
                self.failures.record_success();
                Ok(())
            }
            Err(e) => {
                self.failures.record_failure();
                Err(TransportError::Send(e))
            }
        }
    }

    async fn mcast_noflush_send(&self, payload: &[u8]) -> Result<()> {
        self.mcast_flush_send(payload).await
    }

    async fn mcast_flush_send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        self.deliver_to_self(payload).await?;
        let socket = self.mcast_socket.lock().await;
        match socket.send_to(payload, self.mcast_target).await {
            Ok(_) => {
                self.failures.record_success();
                Ok(())
            }
            Err(e) => {
                self.failures.record_failure();
                Err(TransportError::Send(e))
            }
        }
    }

    async fn iface_check(&self) -> Result<bool> {
        let was_up = self.iface_up.load(Ordering::Relaxed);
        let probe = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(self.config.iface_addr, 0))).await;
        let now_up = probe.is_ok();
        self.iface_up.store(now_up, Ordering::Relaxed);
        if !was_up && now_up {
            tracing::info!(iface = %self.config.iface_addr, "interface back up, rebound probe socket");
            return Ok(true);
        }
        if was_up && !now_up {
            tracing::warn!(iface = %self.config.iface_addr, "interface appears down");
        }
        Ok(false)
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        // The token arrives as a unicast datagram addressed to this node's
        // own `bind_addr:port`, which `mcast_socket` already receives
        // alongside group multicasts — corosync binds one socket per
        // interface for both. `token_socket` above is send-only, bound to
        // an ephemeral port purely so the token's *source* address is
        // stable and distinguishable from regular multicast traffic.
        let mut loop_buf = [0u8; MAX_DATAGRAM];
        let mut mcast_buf = [0u8; MAX_DATAGRAM];

        tokio::select! {
            res = self.loopback_rx.recv(&mut loop_buf) => {
                let n = res.map_err(TransportError::Recv)?;
                Ok(loop_buf[..n].to_vec())
            }
            res = async { self.mcast_socket.lock().await.recv_from(&mut mcast_buf).await } => {
                let (n, _peer) = res.map_err(TransportError::Recv)?;
                Ok(mcast_buf[..n].to_vec())
            }
        }
    }

    fn consecutive_send_failures(&self) -> u64 {
        self.failures.consecutive_failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(port: u16) -> MulticastConfig {
        MulticastConfig {
            iface_addr: Ipv4Addr::LOCALHOST,
            mcast_addr: Ipv4Addr::new(239, 255, 1, 1),
            port,
        }
    }

    #[tokio::test]
    async fn own_multicast_is_delivered_locally() {
        let cfg = loopback_config(23400);
        let token_target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 23401));
        let transport = Multicast::bind(cfg, token_target).await.expect("bind");

        transport.mcast_flush_send(b"hello ring").await.expect("send");
        let received = transport.recv().await.expect("recv");
        assert_eq!(received, b"hello ring");
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_send() {
        let cfg = loopback_config(23402);
        let token_target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 23403));
        let transport = Multicast::bind(cfg, token_target).await.expect("bind");
        let huge = vec![0u8; MAX_DATAGRAM + 1];
        assert!(matches!(
            transport.mcast_flush_send(&huge).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn send_failure_counter_resets_on_success() {
        let cfg = loopback_config(23404);
        let token_target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 23405));
        let transport = Multicast::bind(cfg, token_target).await.expect("bind");
        assert_eq!(transport.consecutive_send_failures(), 0);
        transport.mcast_flush_send(b"ping").await.expect("send");
        assert_eq!(transport.consecutive_send_failures(), 0);
    }
}
