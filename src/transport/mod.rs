//! Byte-stream transport abstraction.
//!
//! The channel engine is transport-agnostic: anything that can move
//! ciphertext bytes and report completions implements [`Transport`]. The
//! channel's own public surface mirrors this contract, so a TLS channel
//! is substitutable for the plain transport beneath it.

pub mod mem;

use bytes::Bytes;

/// POSIX-style error number. Zero means success.
pub type Errno = i32;

/// Completion callback for a single I/O operation.
///
/// Arguments are `(done, data, errno)`: `done` signals that the operation
/// has finished, `data` carries read results (`None` on a read signals
/// EOF; writes always pass `None`), and `errno` is zero on success. Each
/// completion fires exactly once and may fire from any thread.
pub type IoCompletion = Box<dyn FnOnce(bool, Option<Bytes>, Errno) + Send>;

/// An asynchronous byte-stream endpoint.
///
/// Implementations must tolerate at most one outstanding read and one
/// outstanding write at a time; the channel engine never exceeds that.
pub trait Transport: Send + Sync {
    /// Read up to `max` bytes. The completion receives the bytes, EOF
    /// (`data = None`), or an errno.
    fn read(&self, max: usize, completion: IoCompletion);

    /// Write `data` in full. The completion fires once every byte has
    /// been accepted, or with an errno.
    fn write(&self, data: Bytes, completion: IoCompletion);

    /// Close the endpoint. A graceful close (`stop = false`) lets
    /// accepted writes drain to the peer first; a stop-close abandons
    /// them.
    fn close(&self, stop: bool);

    /// Low-water mark hint. Ignored by default.
    fn set_low_water(&self, _n: usize) {}
}
