//! The on-wire SRP datagram.
//!
//! Every datagram handed to the transport is first unwrapped by
//! `totem-crypto`; what's inside is this module's concern: a small fixed
//! header (magic, version, message type, encapsulated flag, source node,
//! destination node) followed by a per-type body.
//!
//! The original wire trick used a single magic byte whose two possible
//! 16-bit renderings let a receiver infer byte order and swap fixed
//! fields accordingly. This implementation takes the documented
//! compatibility-fallback path instead: every multi-byte header field is
//! written big-endian, `MAGIC` is checked literally on receive, and the
//! byte-swap-by-magic trick is not implemented (there is no legacy peer to
//! interoperate with in this codebase) — noted in `DESIGN.md`.

use totem_types::{Msn, NodeId, RingId};

/// Fixed one-byte sentinel opening every datagram.
pub const MAGIC: u8 = 0xEA;
pub const WIRE_VERSION: u8 = 1;

/// Broadcast destination sentinel.
pub const BROADCAST: NodeId = NodeId::new(0);

/// Fixed header size: magic, version, type, encapsulated, src(4), dst(4).
const HEADER_LEN: usize = 1 + 1 + 1 + 1 + 4 + 4;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram shorter than the fixed header")]
    Truncated,

    #[error("unrecognized magic byte {0:#x}")]
    BadMagic(u8),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unrecognized message type {0}")]
    UnknownType(u8),

    #[error("body decode failed: {0}")]
    Body(String),
}

type Result<T> = std::result::Result<T, WireError>;

/// One of the message types carried after the magic/version header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrpMessageType {
    OrfToken,
    Mcast,
    MembMergeDetect,
    MembJoin,
    MembCommitToken,
    TokenHoldCancel,
}

impl SrpMessageType {
    fn to_wire(self) -> u8 {
        match self {
            SrpMessageType::OrfToken => 0,
            SrpMessageType::Mcast => 1,
            SrpMessageType::MembMergeDetect => 2,
            SrpMessageType::MembJoin => 3,
            SrpMessageType::MembCommitToken => 4,
            SrpMessageType::TokenHoldCancel => 5,
        }
    }

    fn from_wire(b: u8) -> Result<Self> {
        Ok(match b {
            0 => SrpMessageType::OrfToken,
            1 => SrpMessageType::Mcast,
            2 => SrpMessageType::MembMergeDetect,
            3 => SrpMessageType::MembJoin,
            4 => SrpMessageType::MembCommitToken,
            5 => SrpMessageType::TokenHoldCancel,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// A regular multicast: the payload is whatever `totem-pg` packed, tagged
/// with the MSN and originator the sender's SRP instance assigned at
/// token-grant time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McastBody {
    pub ring: RingId,
    pub msn: Msn,
    pub originator: NodeId,
    pub payload: Vec<u8>,
}

/// A token-hold-cancel notice: the current holder is relinquishing the
/// token outside the normal rotation (e.g. on clean shutdown), so the
/// successor should not wait out a full hold timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenHoldCancelBody {
    pub ring: RingId,
    pub sender: NodeId,
}

/// The decoded body, one variant per [`SrpMessageType`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SrpPayload {
    Token(totem_srp::Token),
    Mcast(McastBody),
    MergeDetect(totem_srp::MembMergeDetect),
    Join(totem_srp::MembJoin),
    CommitToken(totem_srp::MembCommitToken),
    TokenHoldCancel(TokenHoldCancelBody),
}

impl SrpPayload {
    fn message_type(&self) -> SrpMessageType {
        match self {
            SrpPayload::Token(_) => SrpMessageType::OrfToken,
            SrpPayload::Mcast(_) => SrpMessageType::Mcast,
            SrpPayload::MergeDetect(_) => SrpMessageType::MembMergeDetect,
            SrpPayload::Join(_) => SrpMessageType::MembJoin,
            SrpPayload::CommitToken(_) => SrpMessageType::MembCommitToken,
            SrpPayload::TokenHoldCancel(_) => SrpMessageType::TokenHoldCancel,
        }
    }
}

/// A complete decoded (post-crypto) SRP datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrpDatagram {
    /// Set when this datagram is itself wrapped inside a RECOVERY replay
    /// frame.
    pub encapsulated: bool,
    pub src: NodeId,
    /// `BROADCAST` for ring-wide multicasts; a specific node id for
    /// hop-to-hop unicasts (the token).
    pub dst: NodeId,
    pub payload: SrpPayload,
}

impl SrpDatagram {
    pub fn new(src: NodeId, dst: NodeId, payload: SrpPayload) -> Self {
        Self { encapsulated: false, src, dst, payload }
    }

    pub fn encapsulate(mut self) -> Self {
        self.encapsulated = true;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + 64);
        out.push(MAGIC);
        out.push(WIRE_VERSION);
        out.push(self.payload.message_type().to_wire());
        out.push(u8::from(self.encapsulated));
        out.extend_from_slice(&self.src.get().to_be_bytes());
        out.extend_from_slice(&self.dst.get().to_be_bytes());

        let body_result = match &self.payload {
            SrpPayload::Token(t) => ciborium_encode(t),
            SrpPayload::Mcast(m) => ciborium_encode(&(m.ring, m.msn, m.originator, &m.payload)),
            SrpPayload::MergeDetect(m) => ciborium_encode(m),
            SrpPayload::Join(j) => ciborium_encode(j),
            SrpPayload::CommitToken(c) => ciborium_encode(c),
            SrpPayload::TokenHoldCancel(c) => ciborium_encode(&(c.ring, c.sender)),
        };
        out.extend_from_slice(&body_result?);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        if bytes[0] != MAGIC {
            return Err(WireError::BadMagic(bytes[0]));
        }
        if bytes[1] != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(bytes[1]));
        }
        let msg_type = SrpMessageType::from_wire(bytes[2])?;
        let encapsulated = bytes[3] != 0;
        let src = NodeId::new(u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes")));
        let dst = NodeId::new(u32::from_be_bytes(bytes[8..12].try_into().expect("4 bytes")));
        let body = &bytes[HEADER_LEN..];

        let payload = match msg_type {
            SrpMessageType::OrfToken => SrpPayload::Token(ciborium_decode(body)?),
            SrpMessageType::Mcast => {
                let (ring, msn, originator, payload): (RingId, Msn, NodeId, Vec<u8>) = ciborium_decode(body)?;
                SrpPayload::Mcast(McastBody { ring, msn, originator, payload })
            }
            SrpMessageType::MembMergeDetect => SrpPayload::MergeDetect(ciborium_decode(body)?),
            SrpMessageType::MembJoin => SrpPayload::Join(ciborium_decode(body)?),
            SrpMessageType::MembCommitToken => SrpPayload::CommitToken(ciborium_decode(body)?),
            SrpMessageType::TokenHoldCancel => {
                let (ring, sender): (RingId, NodeId) = ciborium_decode(body)?;
                SrpPayload::TokenHoldCancel(TokenHoldCancelBody { ring, sender })
            }
        };

        Ok(Self { encapsulated, src, dst, payload })
    }
}

fn ciborium_encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Body(e.to_string()))?;
    Ok(buf)
}

fn ciborium_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Body(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn token_round_trips_through_wire_bytes() {
        let ring = RingId::new(n(1), 3);
        let token = totem_srp::Token::initial(ring, n(1));
        let datagram = SrpDatagram::new(n(1), n(2), SrpPayload::Token(token.clone()));
        let bytes = datagram.to_bytes().expect("encode");
        let restored = SrpDatagram::from_bytes(&bytes).expect("decode");
        assert_eq!(restored.src, n(1));
        assert_eq!(restored.dst, n(2));
        assert!(!restored.encapsulated);
        assert_eq!(restored.payload, SrpPayload::Token(token));
    }

    #[test]
    fn mcast_round_trips_with_ring_msn_and_originator() {
        let ring = RingId::new(n(1), 1);
        let body = McastBody { ring, msn: Msn::new(7), originator: n(3), payload: vec![1, 2, 3] };
        let datagram = SrpDatagram::new(n(3), BROADCAST, SrpPayload::Mcast(body.clone()));
        let bytes = datagram.to_bytes().expect("encode");
        let restored = SrpDatagram::from_bytes(&bytes).expect("decode");
        assert_eq!(restored.dst, BROADCAST);
        assert_eq!(restored.payload, SrpPayload::Mcast(body));
    }

    #[test]
    fn encapsulated_flag_survives_the_round_trip() {
        let ring = RingId::new(n(1), 1);
        let datagram = SrpDatagram::new(n(1), BROADCAST, SrpPayload::MergeDetect(totem_srp::MembMergeDetect { sender: n(1), ring })).encapsulate();
        let bytes = datagram.to_bytes().expect("encode");
        let restored = SrpDatagram::from_bytes(&bytes).expect("decode");
        assert!(restored.encapsulated);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = SrpDatagram::new(n(1), n(1), SrpPayload::TokenHoldCancel(TokenHoldCancelBody { ring: RingId::new(n(1), 1), sender: n(1) }))
            .to_bytes()
            .expect("encode");
        bytes[0] = 0x00;
        assert!(matches!(SrpDatagram::from_bytes(&bytes), Err(WireError::BadMagic(0x00))));
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        assert!(matches!(SrpDatagram::from_bytes(&[MAGIC, WIRE_VERSION]), Err(WireError::Truncated)));
    }
}
