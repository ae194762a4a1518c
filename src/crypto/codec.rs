//! Transport codecs applied to tunneled bytes.
//!
//! Stream format (one per direction):
//!
//! ```text
//! +----------+------------------------------+------------------------------+-----
//! | salt(32) | seal(len_be16) | seal(data)  | seal(len_be16) | seal(data)  | ...
//! +----------+------------------------------+------------------------------+-----
//! ```
//!
//! Each sealed block carries a 16-byte tag and consumes one nonce. The
//! decoder keeps partial input between calls, so the stream may be split at
//! any byte boundary.

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

use crate::crypto::{
    derive_subkey, Aead, MasterKey, Nonce, SecureRandom, MAX_CHUNK, SALT_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};

/// Cipher method named in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// ChaCha20-Poly1305 chunked stream
    ChaCha20IetfPoly1305,
    /// Identity transform
    Plain,
}

impl Method {
    /// Configuration name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            Method::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Method::Plain => "plain",
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::ChaCha20IetfPoly1305
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-ietf-poly1305" => Ok(Method::ChaCha20IetfPoly1305),
            "plain" | "none" => Ok(Method::Plain),
            other => Err(Error::config(format!("unsupported method: {}", other))),
        }
    }
}

/// Reversible transform over a byte stream.
pub trait TransportCodec: Send {
    /// Transform outgoing plaintext into wire bytes.
    fn encode(&mut self, data: &[u8]) -> Result<Bytes>;

    /// Transform wire bytes back into plaintext. May return fewer bytes than
    /// were fed when a frame is incomplete.
    fn decode(&mut self, data: &[u8]) -> Result<Bytes>;
}

/// Which way a handler applies its codec to the bytes it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext in, wire bytes out
    Encode,
    /// Wire bytes in, plaintext out
    Decode,
}

/// A codec bound to one direction.
pub struct Codec {
    direction: Direction,
    inner: Box<dyn TransportCodec>,
}

impl Codec {
    /// Bind `inner` to `direction`.
    pub fn new(direction: Direction, inner: Box<dyn TransportCodec>) -> Self {
        Self { direction, inner }
    }

    /// Direction this codec runs in.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run the transform in the bound direction.
    pub fn apply(&mut self, data: &[u8]) -> Result<Bytes> {
        match self.direction {
            Direction::Encode => self.inner.encode(data),
            Direction::Decode => self.inner.decode(data),
        }
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Build a fresh codec instance for `method`.
pub fn new_codec(method: Method, key: &MasterKey) -> Box<dyn TransportCodec> {
    match method {
        Method::ChaCha20IetfPoly1305 => Box::new(AeadCodec::new(key.clone())),
        Method::Plain => Box::new(PlainCodec),
    }
}

/// Identity codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCodec;

impl TransportCodec for PlainCodec {
    fn encode(&mut self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decode(&mut self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Cipher state for one direction, created once the salt is known.
struct StreamCipher {
    aead: Aead,
    nonce: Nonce,
}

impl StreamCipher {
    fn new(master: &MasterKey, salt: &[u8]) -> Result<Self> {
        Ok(Self {
            aead: Aead::new(&derive_subkey(master, salt)?),
            nonce: Nonce::default(),
        })
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.aead.seal(&self.nonce, plaintext)?;
        self.nonce.increment();
        Ok(sealed)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let opened = self.aead.open(&self.nonce, ciphertext)?;
        self.nonce.increment();
        Ok(opened)
    }
}

/// ChaCha20-Poly1305 chunked stream codec.
pub struct AeadCodec {
    master: MasterKey,
    encoder: Option<StreamCipher>,
    decoder: Option<StreamCipher>,
    pending: BytesMut,
    payload_len: Option<usize>,
}

impl AeadCodec {
    /// Create a codec; salts are generated and learned lazily.
    pub fn new(master: MasterKey) -> Self {
        Self {
            master,
            encoder: None,
            decoder: None,
            pending: BytesMut::new(),
            payload_len: None,
        }
    }

    /// Bytes received but not yet decodable.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl TransportCodec for AeadCodec {
    fn encode(&mut self, data: &[u8]) -> Result<Bytes> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }

        let chunks = (data.len() + MAX_CHUNK - 1) / MAX_CHUNK;
        let mut out = BytesMut::with_capacity(SALT_SIZE + data.len() + chunks * (2 + 2 * TAG_SIZE));

        let cipher = match &mut self.encoder {
            Some(cipher) => cipher,
            None => {
                let salt = SecureRandom::bytes::<SALT_SIZE>();
                out.extend_from_slice(&salt);
                self.encoder.insert(StreamCipher::new(&self.master, &salt)?)
            }
        };

        for chunk in data.chunks(MAX_CHUNK) {
            let len = (chunk.len() as u16).to_be_bytes();
            out.extend_from_slice(&cipher.seal(&len)?);
            out.extend_from_slice(&cipher.seal(chunk)?);
        }

        Ok(out.freeze())
    }

    fn decode(&mut self, data: &[u8]) -> Result<Bytes> {
        self.pending.extend_from_slice(data);

        let cipher = match &mut self.decoder {
            Some(cipher) => cipher,
            None => {
                if self.pending.len() < SALT_SIZE {
                    return Ok(Bytes::new());
                }
                let salt = self.pending.split_to(SALT_SIZE);
                self.decoder.insert(StreamCipher::new(&self.master, &salt)?)
            }
        };

        let mut out = BytesMut::new();
        loop {
            match self.payload_len {
                None => {
                    if self.pending.len() < 2 + TAG_SIZE {
                        break;
                    }
                    let block = self.pending.split_to(2 + TAG_SIZE);
                    let len = cipher.open(&block)?;
                    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                    if len == 0 || len > MAX_CHUNK {
                        return Err(Error::crypto(format!("invalid chunk length {}", len)));
                    }
                    self.payload_len = Some(len);
                }
                Some(len) => {
                    if self.pending.len() < len + TAG_SIZE {
                        break;
                    }
                    let block = self.pending.split_to(len + TAG_SIZE);
                    out.extend_from_slice(&cipher.open(&block)?);
                    self.payload_len = None;
                }
            }
        }

        Ok(out.freeze())
    }
}
