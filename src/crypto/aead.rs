//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Wraps the three constructions the relay speaks behind one type, so the
//! stream and packet layers never care which one a node was configured with.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{
    aead::{Aead as AeadTrait, AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce as GenericNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{CipherKind, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey(Vec<u8>);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A nonce for AEAD operations.
///
/// Shadowsocks treats the whole 12 bytes as one little-endian counter that
/// starts at zero for every subkey.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// The all-zero nonce.
    pub const fn zero() -> Self {
        Self([0u8; NONCE_SIZE])
    }

    /// Create a nonce from a 64-bit counter value (little-endian, low bytes).
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Increment the nonce as a little-endian integer, carrying across bytes.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Self::zero()
    }
}

enum Inner {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

/// AEAD cipher instance bound to one (sub)key.
pub struct Aead {
    inner: Inner,
}

macro_rules! dispatch {
    ($inner:expr, $c:ident => $body:expr) => {
        match $inner {
            Inner::ChaCha20Poly1305($c) => $body,
            Inner::Aes128Gcm($c) => $body,
            Inner::Aes256Gcm($c) => $body,
        }
    };
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    ///
    /// # Errors
    ///
    /// Fails if the key length does not match `kind`.
    pub fn new(kind: CipherKind, key: &AeadKey) -> Result<Self> {
        let bad_len = |_| Error::crypto(format!("invalid key length for {}", kind.name()));
        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => {
                Inner::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(bad_len)?)
            }
            CipherKind::Aes128Gcm => {
                Inner::Aes128Gcm(Aes128Gcm::new_from_slice(key.as_bytes()).map_err(bad_len)?)
            }
            CipherKind::Aes256Gcm => {
                Inner::Aes256Gcm(Aes256Gcm::new_from_slice(key.as_bytes()).map_err(bad_len)?)
            }
        };
        Ok(Self { inner })
    }

    /// Encrypt plaintext. Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericNonce::from_slice(nonce.as_bytes());
        dispatch!(&self.inner, c => c.encrypt(nonce, plaintext))
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext with appended tag.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails (wrong key, tampered data, etc.)
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let nonce = GenericNonce::from_slice(nonce.as_bytes());
        dispatch!(&self.inner, c => c.decrypt(nonce, ciphertext))
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }

    /// Encrypt in-place, appending the tag to `buffer`.
    pub fn encrypt_in_place(&self, nonce: &Nonce, buffer: &mut Vec<u8>) -> Result<()> {
        let nonce = GenericNonce::from_slice(nonce.as_bytes());
        dispatch!(&self.inner, c => c.encrypt_in_place(nonce, b"", buffer))
            .map_err(|_| Error::crypto("in-place encryption failed"))
    }

    /// Decrypt in-place, stripping the tag from `buffer`.
    pub fn decrypt_in_place(&self, nonce: &Nonce, buffer: &mut Vec<u8>) -> Result<()> {
        if buffer.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: buffer.len(),
            });
        }

        let nonce = GenericNonce::from_slice(nonce.as_bytes());
        dispatch!(&self.inner, c => c.decrypt_in_place(nonce, b"", buffer))
            .map_err(|_| Error::crypto("in-place decryption/authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(len: usize) -> AeadKey {
        AeadKey::from_bytes((0..len as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_encrypt_decrypt_all_kinds() {
        for kind in [
            CipherKind::ChaCha20Poly1305,
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
        ] {
            let aead = Aead::new(kind, &test_key(kind.key_size())).unwrap();
            let nonce = Nonce::new(1);

            let ciphertext = aead.encrypt(&nonce, b"Hello, World!").unwrap();
            assert_eq!(ciphertext.len(), 13 + TAG_SIZE);
            assert_eq!(aead.decrypt(&nonce, &ciphertext).unwrap(), b"Hello, World!");
        }
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        assert!(Aead::new(CipherKind::Aes128Gcm, &test_key(32)).is_err());
        assert!(Aead::new(CipherKind::ChaCha20Poly1305, &test_key(16)).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let aead = Aead::new(CipherKind::ChaCha20Poly1305, &test_key(32)).unwrap();
        let nonce = Nonce::zero();

        let mut ciphertext = aead.encrypt(&nonce, b"secret data").unwrap();
        ciphertext[0] ^= 0x01;

        assert!(aead.decrypt(&nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let aead = Aead::new(CipherKind::Aes256Gcm, &test_key(32)).unwrap();
        let ciphertext = aead.encrypt(&Nonce::new(0), b"secret data").unwrap();
        assert!(aead.decrypt(&Nonce::new(1), &ciphertext).is_err());
    }

    #[test]
    fn test_nonce_increment_carries() {
        let mut nonce = Nonce::zero();
        nonce.increment();
        assert_eq!(nonce, Nonce::new(1));

        let mut nonce = Nonce::new(0xff);
        nonce.increment();
        assert_eq!(nonce.as_bytes()[..2], [0x00, 0x01]);

        let mut nonce = Nonce::new(u64::MAX);
        nonce.increment();
        assert_eq!(nonce.as_bytes()[..8], [0u8; 8]);
        assert_eq!(nonce.as_bytes()[8], 1);
    }

    #[test]
    fn test_in_place_round_trip() {
        let aead = Aead::new(CipherKind::Aes128Gcm, &test_key(16)).unwrap();
        let nonce = Nonce::new(7);

        let mut buffer = b"in place".to_vec();
        aead.encrypt_in_place(&nonce, &mut buffer).unwrap();
        assert_eq!(buffer.len(), 8 + TAG_SIZE);

        aead.decrypt_in_place(&nonce, &mut buffer).unwrap();
        assert_eq!(buffer, b"in place");
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let aead = Aead::new(CipherKind::Aes128Gcm, &test_key(16)).unwrap();
        assert!(matches!(
            aead.decrypt(&Nonce::zero(), &[0u8; 4]),
            Err(Error::Buffer { expected: TAG_SIZE, actual: 4 })
        ));
    }
}
