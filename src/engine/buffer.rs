//! Chunked byte buffers.
//!
//! A [`ChunkBuffer`] is an ordered queue of [`Bytes`] chunks: appended at the
//! tail, consumed from the head. Chunks are kept as they arrived from the
//! socket and only coalesced when a caller needs a contiguous prefix, e.g. a
//! SOCKS5 header split across several non-blocking reads.

use std::collections::VecDeque;
use std::io::{self, Write};

use bytes::{Buf, Bytes, BytesMut};

/// FIFO queue of byte chunks with an exact byte count.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append a chunk at the tail. Empty chunks are dropped.
    pub fn push(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(data);
    }

    /// Move every chunk of `other` to the tail of `self`.
    pub fn append(&mut self, other: &mut ChunkBuffer) {
        self.len += other.len;
        self.chunks.append(&mut other.chunks);
        other.len = 0;
    }

    /// Rearrange chunks so the first one holds exactly `min(n, len)` bytes.
    ///
    /// Splits the head chunk when it is longer than `n` and merges following
    /// chunks when it is shorter. Byte order is preserved.
    pub fn merge_prefix(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == 0 {
            return;
        }

        let head_len = self.chunks[0].len();
        if head_len == n {
            return;
        }
        if head_len > n {
            let head = self.chunks[0].split_to(n);
            self.chunks.push_front(head);
            return;
        }

        let mut merged = BytesMut::with_capacity(n);
        while merged.len() < n {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let need = n - merged.len();
            if chunk.len() > need {
                merged.extend_from_slice(&chunk[..need]);
                chunk.advance(need);
                self.chunks.push_front(chunk);
            } else {
                merged.extend_from_slice(&chunk);
            }
        }
        self.chunks.push_front(merged.freeze());
    }

    /// Coalesce and borrow the first `min(n, len)` bytes.
    pub fn peek(&mut self, n: usize) -> &[u8] {
        self.merge_prefix(n);
        match self.chunks.front() {
            Some(head) => &head[..n.min(head.len())],
            None => &[],
        }
    }

    /// Remove the first `min(n, len)` bytes as one contiguous chunk.
    pub fn consume(&mut self, n: usize) -> Bytes {
        self.merge_prefix(n);
        if n == 0 {
            return Bytes::new();
        }
        match self.chunks.pop_front() {
            Some(head) => {
                self.len -= head.len();
                head
            }
            None => Bytes::new(),
        }
    }

    /// Remove everything as one contiguous chunk.
    pub fn take_all(&mut self) -> Bytes {
        self.consume(self.len)
    }

    /// Drop all buffered data.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Write buffered chunks to `dst` until it would block or the buffer is
    /// empty. Returns the number of bytes written.
    ///
    /// Partially written chunks keep their unwritten tail at the head.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while let Some(head) = self.chunks.front_mut() {
            match dst.write(head) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    self.len -= n;
                    head.advance(n);
                    if head.is_empty() {
                        self.chunks.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}
