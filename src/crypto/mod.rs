//! Cryptographic primitives for the tunnel transport.
//!
//! This module provides:
//! - ChaCha20-Poly1305 sealing with counter nonces
//! - Password and per-stream subkey derivation (HKDF-SHA256)
//! - Secure random salts
//! - The [`TransportCodec`] framing applied to tunneled bytes
//!
//! All secret material is zeroized on drop.

mod aead;
mod codec;
mod kdf;
mod random;

pub use aead::{Aead, AeadKey, Nonce};
pub use codec::{new_codec, AeadCodec, Codec, Direction, Method, PlainCodec, TransportCodec};
pub use kdf::{derive_subkey, MasterKey};
pub use random::SecureRandom;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the random salt that opens each tunnel direction
pub const SALT_SIZE: usize = 32;

/// Largest payload carried by one sealed chunk
pub const MAX_CHUNK: usize = 0x3FFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_to_stream() {
        let key = MasterKey::from_password("correct horse").unwrap();
        let salt = SecureRandom::bytes::<SALT_SIZE>();

        let sender = Aead::new(&derive_subkey(&key, &salt).unwrap());
        let receiver = Aead::new(&derive_subkey(&key, &salt).unwrap());

        let nonce = Nonce::new(3);
        let sealed = sender.seal(&nonce, b"hello tunnel").unwrap();
        assert_eq!(receiver.open(&nonce, &sealed).unwrap(), b"hello tunnel");

        let other = Aead::new(&derive_subkey(&MasterKey::from_password("wrong").unwrap(), &salt).unwrap());
        assert!(other.open(&nonce, &sealed).is_err());
    }
}
