//! Cipher boundary.
//!
//! This module provides:
//! - Shadowsocks AEAD ciphers (ChaCha20-Poly1305, AES-128-GCM, AES-256-GCM)
//! - EVP_BytesToKey master key derivation and HKDF-SHA1 per-session subkeys
//! - An encrypting stream wrapper for TCP and a packet sealer for UDP
//!
//! Key material is zeroized on drop.

mod aead;
mod kdf;
mod random;
mod stream;

pub use aead::{Aead, AeadKey, Nonce};
pub use kdf::{derive_subkey, evp_bytes_to_key};
pub use random::SecureRandom;
pub use stream::EncryptedStream;

use crate::error::{Error, Result};

/// Size of AEAD nonce in bytes (96 bits for every supported cipher)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Largest plaintext carried by one encrypted chunk.
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// HKDF info string for per-session subkeys.
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD constructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    /// AEAD_CHACHA20_POLY1305
    ChaCha20Poly1305,
    /// AEAD_AES_128_GCM
    Aes128Gcm,
    /// AEAD_AES_256_GCM
    Aes256Gcm,
}

impl CipherKind {
    /// Key length in bytes.
    pub const fn key_size(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::ChaCha20Poly1305 | CipherKind::Aes256Gcm => 32,
        }
    }

    /// Salt length in bytes. Always equal to the key length.
    pub const fn salt_size(self) -> usize {
        self.key_size()
    }

    /// Canonical name.
    pub const fn name(self) -> &'static str {
        match self {
            CipherKind::ChaCha20Poly1305 => "AEAD_CHACHA20_POLY1305",
            CipherKind::Aes128Gcm => "AEAD_AES_128_GCM",
            CipherKind::Aes256Gcm => "AEAD_AES_256_GCM",
        }
    }
}

/// A configured cipher: the result of [`pick_cipher`].
///
/// Cloning is cheap enough to hand one copy to every listener task.
#[derive(Clone)]
pub enum Cipher {
    /// Pass-through, no encryption
    Dummy,
    /// AEAD cipher with its master key
    Aead {
        /// Which construction
        kind: CipherKind,
        /// Master key derived from the password
        key: AeadKey,
    },
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick a cipher by name and derive its master key from `password`.
///
/// Names are matched case-insensitively. The Shadowsocks aliases
/// (`chacha20-ietf-poly1305`, `aes-128-gcm`, `aes-256-gcm`) are accepted.
///
/// # Errors
///
/// Returns [`Error::UnsupportedCipher`] for unrecognized names.
pub fn pick_cipher(name: &str, password: &str) -> Result<Cipher> {
    let kind = match name.to_ascii_uppercase().as_str() {
        "DUMMY" => return Ok(Cipher::Dummy),
        "AEAD_CHACHA20_POLY1305" | "CHACHA20-IETF-POLY1305" => CipherKind::ChaCha20Poly1305,
        "AEAD_AES_128_GCM" | "AES-128-GCM" => CipherKind::Aes128Gcm,
        "AEAD_AES_256_GCM" | "AES-256-GCM" => CipherKind::Aes256Gcm,
        _ => return Err(Error::UnsupportedCipher(name.to_string())),
    };

    let key = evp_bytes_to_key(password.as_bytes(), kind.key_size());
    Ok(Cipher::Aead { kind, key })
}

impl Cipher {
    /// Canonical cipher name.
    pub fn name(&self) -> &'static str {
        match self {
            Cipher::Dummy => "DUMMY",
            Cipher::Aead { kind, .. } => kind.name(),
        }
    }

    /// Wrap a byte stream so that reads decrypt and writes encrypt.
    pub fn wrap_stream<S>(&self, stream: S) -> EncryptedStream<S> {
        match self {
            Cipher::Dummy => EncryptedStream::plain(stream),
            Cipher::Aead { kind, key } => EncryptedStream::new(stream, *kind, key.clone()),
        }
    }

    /// Encrypt one datagram: `[salt][payload + tag]`.
    pub fn seal_packet(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (kind, key) = match self {
            Cipher::Dummy => return Ok(plaintext.to_vec()),
            Cipher::Aead { kind, key } => (*kind, key),
        };

        let mut salt = vec![0u8; kind.salt_size()];
        SecureRandom::fill(&mut salt);
        let aead = Aead::new(kind, &derive_subkey(key, &salt)?)?;

        let mut buffer = plaintext.to_vec();
        aead.encrypt_in_place(&Nonce::zero(), &mut buffer)?;

        salt.extend_from_slice(&buffer);
        Ok(salt)
    }

    /// Decrypt one datagram produced by [`Cipher::seal_packet`].
    ///
    /// # Errors
    ///
    /// Fails on short input or authentication failure.
    pub fn open_packet(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let (kind, key) = match self {
            Cipher::Dummy => return Ok(packet.to_vec()),
            Cipher::Aead { kind, key } => (*kind, key),
        };

        let salt_size = kind.salt_size();
        if packet.len() < salt_size + TAG_SIZE {
            return Err(Error::Buffer {
                expected: salt_size + TAG_SIZE,
                actual: packet.len(),
            });
        }

        let (salt, ciphertext) = packet.split_at(salt_size);
        let aead = Aead::new(kind, &derive_subkey(key, salt)?)?;

        let mut buffer = ciphertext.to_vec();
        aead.decrypt_in_place(&Nonce::zero(), &mut buffer)?;
        Ok(buffer)
    }
}
