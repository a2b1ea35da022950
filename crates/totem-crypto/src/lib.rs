//! Crypto framing for the Totem transport: cipher/hash negotiation, session
//! key derivation, and the authenticated wire frame itself.

pub mod cipher;
pub mod frame;
pub mod hash;
pub mod keys;

pub use cipher::CipherKind;
pub use frame::{header_size, MAX_FRAME_SIZE, SALT_SIZE};
pub use hash::HashKind;
pub use keys::{derive_session_keys, SessionKeys};

/// Errors produced while negotiating, deriving keys for, or running the
/// crypto frame.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("frame carries a legacy (pre-v2) format sentinel")]
    LegacyFormat,

    #[error("unknown cipher identifier {0}")]
    UnknownCipher(u8),

    #[error("unknown hash identifier {0}")]
    UnknownHash(u8),

    #[error("reserved header padding bytes were non-zero")]
    NonZeroPadding,

    #[error("frame shorter than the fixed header/salt/tag overhead")]
    Truncated,

    #[error("authentication tag did not match")]
    MacMismatch,

    #[error("ciphertext padding was invalid")]
    BadPadding,

    #[error("key material was the wrong length for the selected algorithm")]
    InvalidKeyLength,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}
