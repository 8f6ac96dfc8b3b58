//! FIFO byte buffer for ciphertext staging.
//!
//! A `CiphertextBuffer` sits between the synchronous TLS engine and the
//! asynchronous transport: the engine appends or drains whole record
//! batches synchronously, while the transport side moves bounded chunks.
//! The buffer is unbounded; `soft_cap` is an advisory threshold used as a
//! back-pressure hint. A single write may push the length past the cap,
//! after which `available_space()` reports zero until readers catch up.

use std::io;

use bytes::{Buf, Bytes, BytesMut};

/// Default soft capacity in bytes.
pub const DEFAULT_SOFT_CAP: usize = 4096;

/// An append-only FIFO of bytes with a soft capacity.
#[derive(Debug)]
pub struct CiphertextBuffer {
    data: BytesMut,
    soft_cap: usize,
}

impl CiphertextBuffer {
    /// Create a buffer with the given soft capacity.
    pub fn new(soft_cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(soft_cap),
            soft_cap,
        }
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn used_space(&self) -> usize {
        self.data.len()
    }

    /// The configured soft capacity.
    #[inline]
    pub fn soft_cap(&self) -> usize {
        self.soft_cap
    }

    /// Space remaining below the soft cap. Zero once the cap is exceeded;
    /// callers must stop enqueuing until it recovers.
    #[inline]
    pub fn available_space(&self) -> usize {
        self.soft_cap.saturating_sub(self.data.len())
    }

    /// Whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a batch. Succeeds in full; memory pressure is the host's
    /// problem, not ours.
    pub fn write(&mut self, batch: &[u8]) {
        self.data.extend_from_slice(batch);
    }

    /// Remove and return up to `max` bytes (all buffered bytes when
    /// `max` is `None`). Returns `None` when empty.
    pub fn read(&mut self, max: Option<usize>) -> Option<Bytes> {
        if self.data.is_empty() {
            return None;
        }
        let n = match max {
            Some(max) => max.min(self.data.len()),
            None => self.data.len(),
        };
        if n == 0 {
            return None;
        }
        Some(self.data.split_to(n).freeze())
    }

    /// The buffered bytes, front first, without consuming them.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop `n` bytes from the front after a caller has peeked via
    /// [`as_slice`](Self::as_slice).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the buffered length.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.data.len(),
            "consume({}) exceeds buffered bytes ({})",
            n,
            self.data.len()
        );
        self.data.advance(n);
    }
}

/// The TLS engine drains its pending records through `io::Write`; the
/// buffer accepts every byte, so the drain loop always terminates.
impl io::Write for CiphertextBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut buf = CiphertextBuffer::new(64);
        assert!(buf.is_empty());
        assert_eq!(buf.available_space(), 64);

        buf.write(b"hello");
        assert_eq!(buf.used_space(), 5);
        assert_eq!(buf.available_space(), 59);

        let out = buf.read(None).unwrap();
        assert_eq!(&out[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn read_is_bounded_and_fifo() {
        let mut buf = CiphertextBuffer::new(64);
        buf.write(b"abcdef");

        assert_eq!(&buf.read(Some(2)).unwrap()[..], b"ab");
        assert_eq!(&buf.read(Some(100)).unwrap()[..], b"cdef");
        assert!(buf.read(Some(1)).is_none());
    }

    #[test]
    fn read_empty_returns_none() {
        let mut buf = CiphertextBuffer::new(16);
        assert!(buf.read(None).is_none());
        assert!(buf.read(Some(0)).is_none());
    }

    #[test]
    fn soft_cap_may_be_exceeded_by_one_batch() {
        let mut buf = CiphertextBuffer::new(8);
        buf.write(&[0u8; 20]);
        assert_eq!(buf.used_space(), 20);
        assert_eq!(buf.available_space(), 0);

        buf.consume(15);
        assert_eq!(buf.available_space(), 3);
    }

    #[test]
    fn peek_and_consume() {
        let mut buf = CiphertextBuffer::new(16);
        buf.write(b"record");
        assert_eq!(buf.as_slice(), b"record");
        buf.consume(3);
        assert_eq!(buf.as_slice(), b"ord");
    }

    #[test]
    #[should_panic(expected = "consume(4) exceeds buffered bytes")]
    fn consume_past_end_panics() {
        let mut buf = CiphertextBuffer::new(16);
        buf.write(b"abc");
        buf.consume(4);
    }

    #[test]
    fn io_write_accepts_everything() {
        use std::io::Write;
        let mut buf = CiphertextBuffer::new(4);
        assert_eq!(Write::write(&mut buf, &[1u8; 100]).unwrap(), 100);
        assert_eq!(buf.used_space(), 100);
    }
}
