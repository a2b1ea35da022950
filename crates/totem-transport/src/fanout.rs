//! Unicast-fanout transport backend: an operator-supplied peer list stands
//! in for IP multicast on networks that don't route it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::{bind_with_retry, counter, Result, SendFailureCounter, Transport, TransportError};

const MAX_DATAGRAM: usize = 65_507;
const BIND_RETRY_ATTEMPTS: u32 = 8;

/// Sends every "multicast" as a loop of per-peer unicast sends, and the
/// token as a single send to whichever peer currently holds the
/// next-in-ring position.
pub struct UnicastFanout {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peers: tokio::sync::RwLock<Vec<SocketAddr>>,
    token_cursor: AtomicUsize,
    failures: Arc<SendFailureCounter>,
}

impl UnicastFanout {
    pub async fn bind(bind_addr: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self> {
        let socket = bind_with_retry(bind_addr, BIND_RETRY_ATTEMPTS, || async {
            UdpSocket::bind(bind_addr).await
        })
        .await?;

        tracing::info!(%bind_addr, peer_count = peers.len(), "unicast-fanout transport bound");

        Ok(Self {
            socket,
            local_addr: bind_addr,
            peers: tokio::sync::RwLock::new(peers),
            token_cursor: AtomicUsize::new(0),
            failures: counter(),
        })
    }

    /// Replace the peer list, e.g. after a membership change. The token
    /// cursor is left as-is; `totem-srp` is responsible for re-deriving
    /// the correct ring successor, this transport only fans out.
    pub async fn set_peers(&self, peers: Vec<SocketAddr>) {
        *self.peers.write().await = peers;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UnicastFanout {
    async fn token_send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return Err(TransportError::NoPeers);
        }
        let idx = self.token_cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
        match self.socket.send_to(payload, peers[idx]).await {
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
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return Err(TransportError::NoPeers);
        }
        let mut any_ok = false;
        for peer in peers.iter() {
            match self.socket.send_to(payload, *peer).await {
                Ok(_) => any_ok = true,
                Err(e) => tracing::warn!(%peer, error = %e, "fanout send to peer failed"),
            }
        }
        if any_ok {
            self.failures.record_success();
            Ok(())
        } else {
            self.failures.record_failure();
            Err(TransportError::Send(std::io::Error::new(
                std::io::ErrorKind::Other,
                "all fanout peer sends failed",
            )))
        }
    }

    async fn iface_check(&self) -> Result<bool> {
        // Fanout has no multicast-routing interface to watch; the peer
        // list is operator-maintained, so there is nothing to rebind.
        Ok(false)
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, _peer) = self.socket.recv_from(&mut buf).await.map_err(TransportError::Recv)?;
        Ok(buf[..n].to_vec())
    }

    fn consecutive_send_failures(&self) -> u64 {
        self.failures.consecutive_failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_multicast_out_to_every_peer() {
        let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("bind a");
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.expect("bind b");
        let peers = vec![peer_a.local_addr().unwrap(), peer_b.local_addr().unwrap()];

        let sender = UnicastFanout::bind("127.0.0.1:0".parse().unwrap(), peers)
            .await
            .expect("bind sender");
        sender.mcast_flush_send(b"membership change").await.expect("send");

        let mut buf_a = [0u8; 64];
        let mut buf_b = [0u8; 64];
        let (na, _) = peer_a.recv_from(&mut buf_a).await.expect("recv a");
        let (nb, _) = peer_b.recv_from(&mut buf_b).await.expect("recv b");
        assert_eq!(&buf_a[..na], b"membership change");
        assert_eq!(&buf_b[..nb], b"membership change");
    }

    #[tokio::test]
    async fn token_send_without_peers_is_an_error() {
        let sender = UnicastFanout::bind("127.0.0.1:0".parse().unwrap(), Vec::new())
            .await
            .expect("bind sender");
        assert!(matches!(sender.token_send(b"token").await, Err(TransportError::NoPeers)));
    }

    #[tokio::test]
    async fn token_send_rotates_across_peers() {
        let peer_a = UdpSocket::bind("127.0.0.1:0").await.expect("bind a");
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.expect("bind b");
        let peers = vec![peer_a.local_addr().unwrap(), peer_b.local_addr().unwrap()];
        let sender = UnicastFanout::bind("127.0.0.1:0".parse().unwrap(), peers)
            .await
            .expect("bind sender");

        sender.token_send(b"t1").await.expect("send 1");
        sender.token_send(b"t2").await.expect("send 2");

        let mut buf = [0u8; 64];
        let (n, _) = peer_a.recv_from(&mut buf).await.expect("recv a");
        assert_eq!(&buf[..n], b"t1");
        let (n, _) = peer_b.recv_from(&mut buf).await.expect("recv b");
        assert_eq!(&buf[..n], b"t2");
    }
}
