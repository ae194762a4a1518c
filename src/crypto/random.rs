//! Secure random number generation.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random source backed by the OS.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        Self::fill(&mut buf);
        buf
    }
}
