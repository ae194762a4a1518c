//! Key derivation.
//!
//! The configured password is hashed once into a [`MasterKey`]; every
//! tunnel direction then derives its own subkey from the master key and the
//! random salt that opens the stream.
//!
//! The password step is a single HKDF-SHA256 pass with a fixed salt and no
//! work factor, so it offers no resistance to offline guessing. Use a long
//! random password (or key material) shared out of band, not a memorable
//! phrase.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{AeadKey, KEY_SIZE};
use crate::error::{Error, Result};

const MASTER_SALT: &[u8] = b"sstunnel master key";
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Key shared by both endpoints, derived from the password.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Derive the master key from a password.
    ///
    /// Not a password hash: the same password always yields the same key at
    /// negligible cost, so the password must carry the entropy itself.
    pub fn from_password(password: &str) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(MASTER_SALT), password.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(b"master", &mut key)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(Self(key))
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Derive the subkey for one tunnel direction.
///
/// # Arguments
///
/// * `master` - Key derived from the shared password
/// * `salt` - Random salt sent at the head of the stream
pub fn derive_subkey(master: &MasterKey, salt: &[u8]) -> Result<AeadKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SUBKEY_INFO, &mut key)
        .map_err(|_| Error::crypto("HKDF expansion failed"))?;
    Ok(AeadKey::from_bytes(key))
}
