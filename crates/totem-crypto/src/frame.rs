//! The on-wire crypto frame.
//!
//! ```text
//! FrameHeader { cipher: u8, hash: u8, pad0: u8, pad1: u8 }
//! salt[16]
//! ciphertext (or plaintext, for CipherKind::None)
//! tag (HMAC over header || salt || ciphertext, hash-after-encrypt)
//! ```
//!
//! `pad0`/`pad1` must be zero; a non-zero value is a hard rejection before
//! any cryptographic work is attempted.

use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand_core::{CryptoRng, RngCore};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use crate::{CipherKind, CryptoError, HashKind};

/// Fixed salt/IV-material size, matching `SALT_SIZE` in
/// `examples/original_source/exec/totemcrypto.c`.
pub const SALT_SIZE: usize = 16;

/// Protocol-wide frame size ceiling.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// The 4-byte config header that opens every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub cipher: CipherKind,
    pub hash: HashKind,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; 4] {
        [self.cipher.to_wire(), self.hash.to_wire(), 0, 0]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self, CryptoError> {
        if bytes[2] != 0 || bytes[3] != 0 {
            return Err(CryptoError::NonZeroPadding);
        }
        let cipher = CipherKind::from_wire(bytes[0])?;
        let hash = HashKind::from_wire(bytes[1])?;
        Ok(Self { cipher, hash })
    }
}

/// Size in bytes of the header + salt + cipher IV overhead for a given
/// (cipher, hash) selection, so callers can reserve buffer room up front.
/// This intentionally excludes the trailing HMAC tag and the ciphertext
/// body itself, mirroring `crypto_sec_header_size()` in the original
/// source.
pub fn header_size(cipher: CipherKind, _hash: HashKind) -> usize {
    4 + SALT_SIZE + cipher.block_len()
}

/// Encrypt `plaintext` and append an authentication tag.
///
/// Never fails on valid inputs; draws a fresh salt from `rng` per call.
pub fn encrypt_and_sign<R: RngCore + CryptoRng>(
    cipher_key: &[u8],
    hash_key: &[u8],
    cipher: CipherKind,
    hash: HashKind,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, CryptoError> {
    let header = FrameHeader { cipher, hash };
    let mut salt = [0u8; SALT_SIZE];
    rng.fill_bytes(&mut salt);

    let ciphertext = cbc_encrypt(cipher, cipher_key, &salt, plaintext)?;

    let mut frame = Vec::with_capacity(4 + SALT_SIZE + ciphertext.len() + hash.digest_len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&salt);
    frame.extend_from_slice(&ciphertext);

    let tag = hmac_tag(hash, hash_key, &frame)?;
    frame.extend_from_slice(&tag);
    Ok(frame)
}

/// Verify the trailing tag (constant-time), then decrypt.
///
/// On any mismatch — bad tag, non-zero padding, legacy format sentinel,
/// wrong key — returns an error with no plaintext observable.
pub fn authenticate_and_decrypt(
    cipher_key: &[u8],
    hash_key: &[u8],
    frame: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < 4 {
        return Err(CryptoError::Truncated);
    }
    let header_bytes: [u8; 4] = frame[0..4].try_into().map_err(|_| CryptoError::Truncated)?;
    let header = FrameHeader::from_bytes(header_bytes)?;

    let tag_len = header.hash.digest_len();
    if frame.len() < 4 + SALT_SIZE + tag_len {
        return Err(CryptoError::Truncated);
    }
    let (signed_part, tag) = frame.split_at(frame.len() - tag_len);

    let expected_tag = hmac_tag(header.hash, hash_key, signed_part)?;
    if !constant_time_eq(tag, &expected_tag) {
        return Err(CryptoError::MacMismatch);
    }

    let salt = &signed_part[4..4 + SALT_SIZE];
    let ciphertext = &signed_part[4 + SALT_SIZE..];
    cbc_decrypt(header.cipher, cipher_key, salt, ciphertext)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hmac_tag(hash: HashKind, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match hash {
        HashKind::None => Ok(Vec::new()),
        HashKind::Md5Hmac => mac_once::<Hmac<Md5>>(key, data),
        HashKind::Sha1Hmac => mac_once::<Hmac<Sha1>>(key, data),
        HashKind::Sha256Hmac => mac_once::<Hmac<Sha256>>(key, data),
        HashKind::Sha384Hmac => mac_once::<Hmac<Sha384>>(key, data),
        HashKind::Sha512Hmac => mac_once::<Hmac<Sha512>>(key, data),
    }
}

fn mac_once<M: Mac>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = M::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn cbc_encrypt(cipher: CipherKind, key: &[u8], salt: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match cipher {
        CipherKind::None => Ok(plaintext.to_vec()),
        CipherKind::Aes128Cbc => {
            let iv = &salt[..16];
            let enc = cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        CipherKind::Aes192Cbc => {
            let iv = &salt[..16];
            let enc = cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        CipherKind::Aes256Cbc => {
            let iv = &salt[..16];
            let enc = cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        CipherKind::TripleDesCbc => {
            let iv = &salt[..8];
            let enc = cbc::Encryptor::<TdesEde3>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
    }
}

fn cbc_decrypt(cipher: CipherKind, key: &[u8], salt: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match cipher {
        CipherKind::None => Ok(ciphertext.to_vec()),
        CipherKind::Aes128Cbc => {
            let iv = salt.get(..16).ok_or(CryptoError::Truncated)?;
            let dec = cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        }
        CipherKind::Aes192Cbc => {
            let iv = salt.get(..16).ok_or(CryptoError::Truncated)?;
            let dec = cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        }
        CipherKind::Aes256Cbc => {
            let iv = salt.get(..16).ok_or(CryptoError::Truncated)?;
            let dec = cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        }
        CipherKind::TripleDesCbc => {
            let iv = salt.get(..8).ok_or(CryptoError::Truncated)?;
            let dec = cbc::Decryptor::<TdesEde3>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_session_keys;
    use rand::rngs::OsRng;

    fn keys_for(cipher: CipherKind, hash: HashKind) -> (Vec<u8>, Vec<u8>) {
        let k = derive_session_keys(b"a shared cluster secret, 128 bits or more", cipher, hash).expect("derive");
        (k.cipher_key, k.hash_key)
    }

    #[test]
    fn round_trips_for_every_cipher_hash_combination() {
        let ciphers = [
            CipherKind::None,
            CipherKind::Aes128Cbc,
            CipherKind::Aes192Cbc,
            CipherKind::Aes256Cbc,
            CipherKind::TripleDesCbc,
        ];
        let hashes = [
            HashKind::Sha1Hmac,
            HashKind::Sha256Hmac,
            HashKind::Sha384Hmac,
            HashKind::Sha512Hmac,
            HashKind::Md5Hmac,
        ];
        for cipher in ciphers {
            for hash in hashes {
                let (ck, hk) = keys_for(cipher, hash);
                let plaintext = b"totem single ring ordering and membership protocol";
                let frame = encrypt_and_sign(&ck, &hk, cipher, hash, plaintext, &mut OsRng).expect("encrypt");
                let recovered = authenticate_and_decrypt(&ck, &hk, &frame).expect("decrypt");
                assert_eq!(recovered, plaintext);
            }
        }
    }

    #[test]
    fn bit_flip_is_rejected() {
        let (ck, hk) = keys_for(CipherKind::Aes256Cbc, HashKind::Sha256Hmac);
        let mut frame = encrypt_and_sign(&ck, &hk, CipherKind::Aes256Cbc, HashKind::Sha256Hmac, b"hello ring", &mut OsRng)
            .expect("encrypt");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(authenticate_and_decrypt(&ck, &hk, &frame).is_err());
    }

    #[test]
    fn non_zero_padding_is_rejected() {
        let header = FrameHeader { cipher: CipherKind::None, hash: HashKind::None };
        let mut bytes = header.to_bytes();
        bytes[2] = 1;
        assert!(matches!(FrameHeader::from_bytes(bytes), Err(CryptoError::NonZeroPadding)));
    }

    #[test]
    fn legacy_sentinel_is_rejected() {
        let bytes = [0xFEu8, 0x00, 0x00, 0x00];
        assert!(matches!(FrameHeader::from_bytes(bytes), Err(CryptoError::LegacyFormat)));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (ck, hk) = keys_for(CipherKind::Aes128Cbc, HashKind::Sha1Hmac);
        let frame = encrypt_and_sign(&ck, &hk, CipherKind::Aes128Cbc, HashKind::Sha1Hmac, b"payload", &mut OsRng)
            .expect("encrypt");
        let (other_ck, other_hk) = keys_for(CipherKind::Aes128Cbc, HashKind::Sha1Hmac);
        // same derivation input would actually match; use a distinct secret instead
        let _ = (other_ck, other_hk);
        let (wrong_ck, wrong_hk) = {
            let k = derive_session_keys(b"a different cluster secret", CipherKind::Aes128Cbc, HashKind::Sha1Hmac)
                .expect("derive");
            (k.cipher_key, k.hash_key)
        };
        assert!(authenticate_and_decrypt(&wrong_ck, &wrong_hk, &frame).is_err());
    }

    #[test]
    fn header_size_accounts_for_cipher_block_len() {
        assert_eq!(header_size(CipherKind::None, HashKind::Sha256Hmac), 4 + SALT_SIZE);
        assert_eq!(header_size(CipherKind::Aes256Cbc, HashKind::Sha256Hmac), 4 + SALT_SIZE + 16);
        assert_eq!(header_size(CipherKind::TripleDesCbc, HashKind::Sha256Hmac), 4 + SALT_SIZE + 8);
    }
}
