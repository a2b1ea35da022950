//! Cipher kind negotiation.

use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Wire-encoded cipher selection.
///
/// The numeric values and the two legacy sentinels match
/// `examples/original_source/exec/totemcrypto.c`'s
/// `crypto_crypt_t` enum, so that the on-wire byte is stable across an
/// implementation boundary even though this crate does not aim for
/// bit-for-bit NSS compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CipherKind {
    None = 0,
    Aes256Cbc = 1,
    Aes192Cbc = 2,
    Aes128Cbc = 3,
    TripleDesCbc = 4,
}

/// The two byte values reserved for the legacy (pre-v2) wire format. A
/// frame carrying either must be hard-rejected, never silently
/// reinterpreted.
pub const LEGACY_SENTINELS: [u8; 2] = [0xFE, 0xFF];

impl CipherKind {
    pub fn from_wire(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Aes256Cbc),
            2 => Ok(Self::Aes192Cbc),
            3 => Ok(Self::Aes128Cbc),
            4 => Ok(Self::TripleDesCbc),
            v if LEGACY_SENTINELS.contains(&v) => Err(CryptoError::LegacyFormat),
            v => Err(CryptoError::UnknownCipher(v)),
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Key length in bytes.
    pub const fn key_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes256Cbc => 32,
            Self::Aes192Cbc => 24,
            Self::Aes128Cbc => 16,
            Self::TripleDesCbc => 24,
        }
    }

    /// CBC block size in bytes (also the IV length).
    pub const fn block_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes256Cbc | Self::Aes192Cbc | Self::Aes128Cbc => 16,
            Self::TripleDesCbc => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_encoding() {
        for kind in [
            CipherKind::None,
            CipherKind::Aes256Cbc,
            CipherKind::Aes192Cbc,
            CipherKind::Aes128Cbc,
            CipherKind::TripleDesCbc,
        ] {
            assert_eq!(CipherKind::from_wire(kind.to_wire()).expect("valid"), kind);
        }
    }

    #[test]
    fn rejects_legacy_sentinels() {
        assert!(matches!(
            CipherKind::from_wire(0xFE),
            Err(CryptoError::LegacyFormat)
        ));
        assert!(matches!(
            CipherKind::from_wire(0xFF),
            Err(CryptoError::LegacyFormat)
        ));
    }

    #[test]
    fn rejects_unknown_value() {
        assert!(matches!(
            CipherKind::from_wire(99),
            Err(CryptoError::UnknownCipher(99))
        ));
    }
}
