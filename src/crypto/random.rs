//! Secure random number generation.
//!
//! Salts come from the operating system's entropy source.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}
