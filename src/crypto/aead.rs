//! ChaCha20-Poly1305 sealing.
//!
//! Every tunnel direction uses its own subkey, so a plain counter nonce is
//! unique for the lifetime of the key.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Counter nonce, little-endian in the first eight bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a counter value.
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(counter)
    }

    /// Advance to the next counter value.
    pub fn increment(&mut self) {
        let next = self.counter().wrapping_add(1);
        self.0[..8].copy_from_slice(&next.to_le_bytes());
    }
}

/// ChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt `plaintext`. Returns ciphertext || tag.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt and authenticate `ciphertext` (with its tag appended).
    ///
    /// # Errors
    ///
    /// Returns an error if the input is shorter than a tag or fails
    /// authentication (wrong key, tampered data, reordered chunk).
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::crypto(format!(
                "sealed chunk too short: {} bytes",
                ciphertext.len()
            )));
        }

        self.cipher
            .decrypt(nonce.as_bytes().into(), ciphertext)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        let mut bytes = [0u8; KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        AeadKey::from_bytes(bytes)
    }

    #[test]
    fn test_seal_open() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::new(1);

        let sealed = aead.seal(&nonce, b"Hello, World!").unwrap();
        assert_eq!(sealed.len(), 13 + TAG_SIZE);
        assert_eq!(aead.open(&nonce, &sealed).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let aead = Aead::new(&test_key());
        let sealed = aead.seal(&Nonce::new(1), b"secret data").unwrap();

        assert!(aead.open(&Nonce::new(2), &sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::new(0);

        let mut sealed = aead.seal(&nonce, b"secret data").unwrap();
        sealed[0] ^= 0x01;

        assert!(aead.open(&nonce, &sealed).is_err());
        assert!(aead.open(&nonce, &sealed[..4]).is_err());
    }

    #[test]
    fn test_nonce_increment() {
        let mut nonce = Nonce::default();
        assert_eq!(nonce.counter(), 0);

        nonce.increment();
        nonce.increment();
        assert_eq!(nonce.counter(), 2);
        assert_eq!(nonce.as_bytes()[0], 2);
        assert_eq!(nonce.as_bytes()[8..], [0u8; 4]);
    }

    #[test]
    fn test_key_debug_hides_bytes() {
        assert_eq!(format!("{:?}", test_key()), "AeadKey(..)");
    }
}
