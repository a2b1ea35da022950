//! Session key derivation.
//!
//! "The shared secret is imported by wrapping and re-unwrapping through a
//! transient per-session wrapping key, so raw key material never enters the
//! general key table." We model that as an HKDF-SHA256 expansion of the
//! configured private key (the corosync `authkey` equivalent) through a
//! fixed, per-session `info` tag, so a single shared secret yields two
//! domain-separated sub-keys and the raw secret is never handed directly to
//! a block cipher or a `Hmac` instance.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{CipherKind, CryptoError, HashKind};

const WRAP_INFO: &[u8] = b"totem-session-wrap-v1";
const CIPHER_CONTEXT: &[u8] = b"cipher";
const HASH_CONTEXT: &[u8] = b"hash";

/// The two derived symmetric keys used for a given (cipher, hash) wire
/// configuration: one for the CBC cipher, one for the HMAC.
pub struct SessionKeys {
    pub cipher_key: Vec<u8>,
    pub hash_key: Vec<u8>,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.hash_key.zeroize();
    }
}

/// Derive session keys for the given cipher/hash selection from the shared
/// private key.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF's expand step is asked for
/// more output than RFC 5869 allows (never true for the algorithms this
/// crate supports, but checked rather than unwrapped).
pub fn derive_session_keys(
    private_key: &[u8],
    cipher: CipherKind,
    hash: HashKind,
) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, private_key);

    let cipher_key_len = cipher.key_len().max(1);
    let mut cipher_key = vec![0u8; cipher_key_len];
    let mut cipher_info = Vec::with_capacity(WRAP_INFO.len() + CIPHER_CONTEXT.len() + 1);
    cipher_info.extend_from_slice(WRAP_INFO);
    cipher_info.push(b':');
    cipher_info.extend_from_slice(CIPHER_CONTEXT);
    hk.expand(&cipher_info, &mut cipher_key)
        .map_err(|_| CryptoError::KeyDerivation("cipher key expand failed".into()))?;
    cipher_key.truncate(cipher.key_len());

    let hash_key_len = hash.key_len().max(1);
    let mut hash_key = vec![0u8; hash_key_len];
    let mut hash_info = Vec::with_capacity(WRAP_INFO.len() + HASH_CONTEXT.len() + 1);
    hash_info.extend_from_slice(WRAP_INFO);
    hash_info.push(b':');
    hash_info.extend_from_slice(HASH_CONTEXT);
    hk.expand(&hash_info, &mut hash_key)
        .map_err(|_| CryptoError::KeyDerivation("hash key expand failed".into()))?;
    hash_key.truncate(hash.key_len());

    Ok(SessionKeys { cipher_key, hash_key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_keys_of_the_expected_length() {
        let keys = derive_session_keys(b"some shared secret material", CipherKind::Aes256Cbc, HashKind::Sha256Hmac)
            .expect("derive");
        assert_eq!(keys.cipher_key.len(), CipherKind::Aes256Cbc.key_len());
        assert_eq!(keys.hash_key.len(), HashKind::Sha256Hmac.key_len());
    }

    #[test]
    fn different_secrets_derive_different_keys() {
        let a = derive_session_keys(b"secret-a", CipherKind::Aes128Cbc, HashKind::Sha1Hmac).expect("derive");
        let b = derive_session_keys(b"secret-b", CipherKind::Aes128Cbc, HashKind::Sha1Hmac).expect("derive");
        assert_ne!(a.cipher_key, b.cipher_key);
        assert_ne!(a.hash_key, b.hash_key);
    }

    #[test]
    fn cipher_and_hash_keys_are_domain_separated() {
        let keys = derive_session_keys(b"same secret", CipherKind::Aes128Cbc, HashKind::Md5Hmac).expect("derive");
        // Different context tags must not collide even when both keys
        // happen to share a length.
        assert_ne!(keys.cipher_key[..keys.hash_key.len().min(keys.cipher_key.len())], keys.hash_key[..keys.hash_key.len().min(keys.cipher_key.len())]);
    }
}
