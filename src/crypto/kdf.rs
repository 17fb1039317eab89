//! Key Derivation Functions.
//!
//! Master keys come from the configured password via OpenSSL's
//! EVP_BytesToKey (MD5, one iteration). Every connection or datagram then
//! derives a fresh subkey from the master key and a random salt with
//! HKDF-SHA1.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::crypto::{AeadKey, SUBKEY_INFO};
use crate::error::{Error, Result};

/// Derive a `key_len`-byte master key from a password.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> AeadKey {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    AeadKey::from_bytes(key)
}

/// Derive the per-session subkey for `salt`.
///
/// The subkey has the same length as the master key.
pub fn derive_subkey(master: &AeadKey, salt: &[u8]) -> Result<AeadKey> {
    let hkdf = Hkdf::<Sha1>::new(Some(salt), master.as_bytes());
    let mut okm = vec![0u8; master.as_bytes().len()];
    hkdf.expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| Error::crypto("HKDF expansion failed"))?;
    Ok(AeadKey::from_bytes(okm))
}
