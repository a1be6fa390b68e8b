//! Password-to-key localization (RFC 3414 §2.6/A.2) and HMAC authentication.

use digest::Digest;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::AuthProtocol;
use crate::error::{AuthErrorKind, CryptoErrorKind, Error, Result};

/// One megabyte of password-derived material digested during localization
/// (RFC 3414 Appendix A.2, step 1).
const PASSWORD_EXPANSION_LEN: usize = 1_048_576;

/// A master key: `Ku = digest(password expanded to 1MiB)`, before engine
/// localization. Held only transiently; [`LocalizedKey`] is what gets stored
/// and reused across requests.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    /// Derive `Ku` from a plaintext password per RFC 3414 Appendix A.2.1.
    pub fn derive(protocol: AuthProtocol, password: &[u8]) -> Self {
        if password.is_empty() {
            return Self(vec![0u8; protocol.digest_len()]);
        }

        let mut expanded = Vec::with_capacity(PASSWORD_EXPANSION_LEN);
        while expanded.len() < PASSWORD_EXPANSION_LEN {
            let remaining = PASSWORD_EXPANSION_LEN - expanded.len();
            let take = remaining.min(password.len());
            expanded.extend_from_slice(&password[..take]);
        }
        expanded.truncate(PASSWORD_EXPANSION_LEN);

        let digest = digest_with(protocol, &expanded);
        expanded.zeroize();
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A key localized to a specific SNMP engine: `Kul = digest(Ku || engineID || Ku)`.
///
/// This is the key actually used for HMAC authentication (and, after
/// extension, as privacy key material).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LocalizedKey(Vec<u8>);

impl LocalizedKey {
    /// Localize a master key to `engine_id` (RFC 3414 Appendix A.2.2).
    pub fn localize(protocol: AuthProtocol, master: &MasterKey, engine_id: &[u8]) -> Self {
        let mut input = Vec::with_capacity(master.as_bytes().len() * 2 + engine_id.len());
        input.extend_from_slice(master.as_bytes());
        input.extend_from_slice(engine_id);
        input.extend_from_slice(master.as_bytes());
        let digest = digest_with(protocol, &input);
        input.zeroize();
        Self(digest)
    }

    /// Derive directly from a password and engine ID, skipping an explicit
    /// intermediate [`MasterKey`].
    pub fn from_password(protocol: AuthProtocol, password: &[u8], engine_id: &[u8]) -> Self {
        let master = MasterKey::derive(protocol, password);
        Self::localize(protocol, &master, engine_id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Compute the truncated HMAC tag for `message` using this key.
    pub fn sign(&self, protocol: AuthProtocol, message: &[u8]) -> Vec<u8> {
        let full = hmac_with(protocol, &self.0, message);
        full[..protocol.mac_len()].to_vec()
    }

    /// Verify `tag` (the wire `msgAuthenticationParameters`) against `message`,
    /// with the auth-params region in `message` expected to already be
    /// zero-filled at the point this was computed from.
    pub fn verify(&self, protocol: AuthProtocol, message: &[u8], tag: &[u8]) -> Result<()> {
        if tag.len() != protocol.mac_len() {
            return Err(Error::auth(
                None,
                AuthErrorKind::WrongMacLength {
                    expected: protocol.mac_len(),
                    actual: tag.len(),
                },
            ));
        }
        let expected = self.sign(protocol, message);
        if subtle::ConstantTimeEq::ct_eq(expected.as_slice(), tag).into() {
            Ok(())
        } else {
            Err(Error::auth(None, AuthErrorKind::HmacMismatch))
        }
    }
}

/// Localized authentication and (optionally) privacy keys for one user on one
/// engine, as produced once at session setup.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKeys {
    auth: Vec<u8>,
    priv_: Option<Vec<u8>>,
}

impl MasterKeys {
    pub fn new(auth: LocalizedKey) -> Self {
        Self {
            auth: auth.0,
            priv_: None,
        }
    }

    pub fn with_priv_key(mut self, priv_key: Vec<u8>) -> Self {
        self.priv_ = Some(priv_key);
        self
    }

    pub fn auth_key(&self) -> &[u8] {
        &self.auth
    }

    pub fn priv_key(&self) -> Option<&[u8]> {
        self.priv_.as_deref()
    }
}

fn digest_with(protocol: AuthProtocol, data: &[u8]) -> Vec<u8> {
    match protocol {
        AuthProtocol::Md5 => Md5::digest(data).to_vec(),
        AuthProtocol::Sha1 => Sha1::digest(data).to_vec(),
        AuthProtocol::Sha256 => Sha256::digest(data).to_vec(),
        AuthProtocol::Sha384 => Sha384::digest(data).to_vec(),
        AuthProtocol::Sha512 => Sha512::digest(data).to_vec(),
    }
}

fn hmac_with(protocol: AuthProtocol, key: &[u8], message: &[u8]) -> Vec<u8> {
    // CryptoErrorKind::InvalidKeyLength is unreachable here: HMAC accepts any
    // key length, it's only surfaced for symmetric cipher keys in `privacy`.
    match protocol {
        AuthProtocol::Md5 => {
            let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        AuthProtocol::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        AuthProtocol::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        AuthProtocol::Sha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        AuthProtocol::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Blumenthal AES-192/256 key extension (draft-blumenthal-aes-usm-04 §3.1.2.1):
/// repeatedly digest the previous localized key material, appending until
/// `target_len` bytes are available.
pub(crate) fn extend_key(
    protocol: AuthProtocol,
    localized: &LocalizedKey,
    target_len: usize,
) -> Result<Vec<u8>> {
    let mut material = localized.as_bytes().to_vec();
    while material.len() < target_len {
        let next = digest_with(protocol, &material[material.len() - localized.as_bytes().len()..]);
        material.extend_from_slice(&next);
    }
    material.truncate(target_len);
    if material.len() < target_len {
        return Err(Error::encrypt(None, CryptoErrorKind::InvalidKeyLength));
    }
    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_derivation_is_deterministic() {
        let a = MasterKey::derive(AuthProtocol::Md5, b"maplesyrup");
        let b = MasterKey::derive(AuthProtocol::Md5, b"maplesyrup");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), 16);
    }

    #[test]
    fn test_master_key_rfc3414_test_vector_md5() {
        // RFC 3414 Appendix A.3.1.
        let master = MasterKey::derive(AuthProtocol::Md5, b"maplesyrup");
        assert_eq!(
            master.as_bytes(),
            &[
                0x9f, 0x9f, 0xe3, 0x4a, 0x0a, 0x20, 0x24, 0x57, 0x94, 0x17, 0xdc, 0x31, 0xdd, 0x34,
                0xb4, 0x33,
            ]
        );
    }

    #[test]
    fn test_localized_key_rfc3414_test_vector_md5() {
        // RFC 3414 Appendix A.3.1.
        let master = MasterKey::derive(AuthProtocol::Md5, b"maplesyrup");
        let engine_id = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02,
        ];
        let localized = LocalizedKey::localize(AuthProtocol::Md5, &master, &engine_id);
        assert_eq!(
            localized.as_bytes(),
            &[
                0x52, 0x6f, 0x5e, 0xed, 0x9f, 0xcc, 0xe2, 0x6f, 0x89, 0x64, 0xc2, 0x93, 0x07, 0x87,
                0xd8, 0x2b,
            ]
        );
    }

    #[test]
    fn test_different_engines_produce_different_localized_keys() {
        let master = MasterKey::derive(AuthProtocol::Sha1, b"password123");
        let a = LocalizedKey::localize(AuthProtocol::Sha1, &master, b"engine-a");
        let b = LocalizedKey::localize(AuthProtocol::Sha1, &master, b"engine-b");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let key = LocalizedKey::from_password(AuthProtocol::Sha256, b"hunter2", b"engine-id");
        let message = b"a complete SNMP message with zeroed auth params";
        let tag = key.sign(AuthProtocol::Sha256, message);
        assert_eq!(tag.len(), AuthProtocol::Sha256.mac_len());
        assert!(key.verify(AuthProtocol::Sha256, message, &tag).is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let key = LocalizedKey::from_password(AuthProtocol::Sha1, b"hunter2", b"engine-id");
        let tag = key.sign(AuthProtocol::Sha1, b"original message");
        assert!(key.verify(AuthProtocol::Sha1, b"tampered message", &tag).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_length_tag() {
        let key = LocalizedKey::from_password(AuthProtocol::Md5, b"hunter2", b"engine-id");
        let err = key.verify(AuthProtocol::Md5, b"msg", &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            Error::AuthenticationFailed {
                kind: AuthErrorKind::WrongMacLength { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_extend_key_produces_requested_length() {
        let key = LocalizedKey::from_password(AuthProtocol::Sha1, b"hunter2", b"engine-id");
        let extended = extend_key(AuthProtocol::Sha1, &key, 32).unwrap();
        assert_eq!(extended.len(), 32);
    }

    #[test]
    fn test_extend_key_deterministic() {
        let key = LocalizedKey::from_password(AuthProtocol::Sha256, b"hunter2", b"engine-id");
        let a = extend_key(AuthProtocol::Sha256, &key, 32).unwrap();
        let b = extend_key(AuthProtocol::Sha256, &key, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_password_yields_zeroed_master_key() {
        let master = MasterKey::derive(AuthProtocol::Md5, b"");
        assert_eq!(master.as_bytes(), &[0u8; 16]);
    }
}
