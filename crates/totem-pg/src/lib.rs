//! Packed-message layer: coalesces service messages into SRP frames and
//! reassembles fragments that didn't fit in one.

mod error;
mod packer;
mod reassembly;

pub use error::{PgError, Result};
pub use packer::{max_single_message_size, PackedFrame, PackedMessageBuilder, PgMessage};
pub use reassembly::{ReassemblyKey, Reassembler};

/// The budget a [`PackedMessageBuilder`] should use for a given crypto
/// selection: the protocol-wide frame ceiling minus whatever
/// `totem-crypto` needs for its header/salt/tag overhead.
pub fn frame_budget(cipher: totem_crypto::CipherKind, hash: totem_crypto::HashKind) -> usize {
    totem_crypto::MAX_FRAME_SIZE.saturating_sub(totem_crypto::header_size(cipher, hash) + hash.digest_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_budget_is_smaller_than_the_raw_ceiling() {
        let budget = frame_budget(totem_crypto::CipherKind::Aes256Cbc, totem_crypto::HashKind::Sha256Hmac);
        assert!(budget < totem_crypto::MAX_FRAME_SIZE);
        assert!(budget > 0);
    }
}
