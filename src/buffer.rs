//! Incremental input buffer used by connections and codecs.
//!
//! ```text
//!  0          read            write         capacity
//!  ├──────────┼───────────────┼─────────────┤
//!   consumed     buffered        spare
//! ```
//!
//! `peek` never moves the read cursor, `consume` is the only operation that
//! does, and `reset` drops everything. Space is reclaimed by compacting the
//! buffered bytes to the front before the backing storage grows.

use std::io::{self, Read};

use crate::object_pool::Recycle;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

// Buffers that grew past this are shrunk back when returned to the pool.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Buffer API that codecs decode from.
///
/// Implemented by [`RingBuffer`] and [`Connection`](crate::Connection), so a
/// codec can be exercised against a bare buffer in tests and against a live
/// connection in the event loop.
pub trait ReadBuffer {
    /// Peeks at up to `n` buffered bytes without consuming them. The returned
    /// size is `min(n, buffered)`.
    fn read_n(&self, n: usize) -> (usize, &[u8]);

    /// Consumes up to `n` bytes, returning how many were consumed.
    fn shift_n(&mut self, n: usize) -> usize;

    /// Discards every buffered byte.
    fn reset_buffer(&mut self);

    /// Number of bytes available to `read_n`.
    fn buffered(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read: 0,
            write: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn peek(&self, n: usize) -> &[u8] {
        let end = self.read + n.min(self.len());
        &self.buf[self.read..end]
    }

    /// Advances the read cursor by `n`, clamped to the buffered length.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
        n
    }

    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.buf[self.write..self.write + data.len()].copy_from_slice(data);
        self.write += data.len();
    }

    /// Performs a single `read` of at most `chunk` bytes from `src`.
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R, chunk: usize) -> io::Result<usize> {
        let chunk = chunk.max(1);
        self.reserve(chunk);
        let n = src.read(&mut self.buf[self.write..self.write + chunk])?;
        self.write += n;
        Ok(n)
    }

    /// Ensures at least `additional` bytes of spare capacity after the write
    /// cursor.
    fn reserve(&mut self, additional: usize) {
        if self.buf.len() - self.write >= additional {
            return;
        }

        if self.read > 0 {
            self.buf.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
            if self.buf.len() - self.write >= additional {
                return;
            }
        }

        let needed = self.write + additional;
        let new_len = needed.max(self.buf.len() * 2).max(DEFAULT_BUFFER_SIZE);
        self.buf.resize(new_len, 0);
    }
}

impl ReadBuffer for RingBuffer {
    fn read_n(&self, n: usize) -> (usize, &[u8]) {
        let data = self.peek(n);
        (data.len(), data)
    }

    fn shift_n(&mut self, n: usize) -> usize {
        self.consume(n)
    }

    fn reset_buffer(&mut self) {
        self.reset();
    }

    fn buffered(&self) -> usize {
        self.len()
    }
}

impl Recycle for RingBuffer {
    fn recycle(&mut self) {
        self.reset();
        if self.buf.len() > MAX_RETAINED_CAPACITY {
            self.buf.truncate(DEFAULT_BUFFER_SIZE);
            self.buf.shrink_to_fit();
        }
    }
}
