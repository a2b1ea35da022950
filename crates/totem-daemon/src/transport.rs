//! Picks one of `totem-transport`'s two backends at startup and hides the
//! choice behind a single concrete type, since `Transport`'s async-fn
//! methods keep it from being object-safe and the two backends don't share
//! a membership-update signature (`Multicast::set_token_target` wants the
//! token's next hop, `UnicastFanout::set_peers` wants the whole list).

use std::collections::HashMap;
use std::net::SocketAddr;

use totem_transport::{Multicast, Result, Transport, UnicastFanout};
use totem_types::NodeId;

pub enum AnyTransport {
    Multicast(Multicast),
    Fanout(UnicastFanout),
}

impl AnyTransport {
    /// Re-point the backend at the current ring: the multicast backend only
    /// needs the token's next hop, the fanout backend needs every other
    /// member's address.
    pub async fn update_membership(&self, self_id: NodeId, successor: NodeId, book: &HashMap<NodeId, SocketAddr>) {
        match self {
            AnyTransport::Multicast(m) => {
                if let Some(addr) = book.get(&successor) {
                    m.set_token_target(*addr).await;
                }
            }
            AnyTransport::Fanout(f) => {
                let peers: Vec<SocketAddr> =
                    book.iter().filter(|(id, _)| **id != self_id).map(|(_, addr)| *addr).collect();
                f.set_peers(peers).await;
            }
        }
    }
}

impl Transport for AnyTransport {
    async fn token_send(&self, payload: &[u8]) -> Result<()> {
        match self {
            AnyTransport::Multicast(m) => m.token_send(payload).await,
            AnyTransport::Fanout(f) => f.token_send(payload).await,
        }
    }

    async fn mcast_noflush_send(&self, payload: &[u8]) -> Result<()> {
        match self {
            AnyTransport::Multicast(m) => m.mcast_noflush_send(payload).await,
            AnyTransport::Fanout(f) => f.mcast_noflush_send(payload).await,
        }
    }

    async fn mcast_flush_send(&self, payload: &[u8]) -> Result<()> {
        match self {
            AnyTransport::Multicast(m) => m.mcast_flush_send(payload).await,
            AnyTransport::Fanout(f) => f.mcast_flush_send(payload).await,
        }
    }

    async fn iface_check(&self) -> Result<bool> {
        match self {
            AnyTransport::Multicast(m) => m.iface_check().await,
            AnyTransport::Fanout(f) => f.iface_check().await,
        }
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        match self {
            AnyTransport::Multicast(m) => m.recv().await,
            AnyTransport::Fanout(f) => f.recv().await,
        }
    }

    fn consecutive_send_failures(&self) -> u64 {
        match self {
            AnyTransport::Multicast(m) => m.consecutive_send_failures(),
            AnyTransport::Fanout(f) => f.consecutive_send_failures(),
        }
    }
}
