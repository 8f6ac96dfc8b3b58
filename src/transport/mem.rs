//! In-memory duplex transport.
//!
//! A [`pair`] of endpoints wired back-to-back through two bounded byte
//! pipes. Each direction parks at most one read and one write (the
//! channel engine never issues more), and completions fire outside the
//! pipe locks, so a completion handler may immediately issue follow-up
//! transport operations.
//!
//! Endpoints are cheaply cloneable handles; tests keep a clone to drive
//! fault injection after handing the endpoint to a channel.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{Errno, IoCompletion, Transport};

/// Default pipe capacity in bytes.
pub const DEFAULT_PIPE_CAPACITY: usize = 16 * 1024;

struct ParkedRead {
    max: usize,
    completion: IoCompletion,
}

struct ParkedWrite {
    data: Bytes,
    completion: IoCompletion,
}

/// One direction of the duplex: a bounded FIFO plus parked operations.
struct PipeCore {
    buf: BytesMut,
    capacity: usize,
    eof: bool,
    aborted: bool,
    parked_read: Option<ParkedRead>,
    parked_write: Option<ParkedWrite>,
}

impl PipeCore {
    fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            eof: false,
            aborted: false,
            parked_read: None,
            parked_write: None,
        }
    }
}

type Firing = (IoCompletion, bool, Option<Bytes>, Errno);

/// Move bytes writer -> buffer -> reader until nothing progresses.
/// Completions are collected, never invoked under the lock.
fn advance(core: &mut PipeCore, out: &mut Vec<Firing>) {
    loop {
        let mut moved = false;

        if let Some(write) = core.parked_write.take() {
            if core.aborted {
                out.push((write.completion, true, None, libc::EPIPE));
                moved = true;
            } else {
                let room = core.capacity - core.buf.len();
                if room == 0 {
                    core.parked_write = Some(write);
                } else if write.data.len() <= room {
                    core.buf.extend_from_slice(&write.data);
                    out.push((write.completion, true, None, 0));
                    moved = true;
                } else {
                    core.buf.extend_from_slice(&write.data[..room]);
                    core.parked_write = Some(ParkedWrite {
                        data: write.data.slice(room..),
                        completion: write.completion,
                    });
                    moved = true;
                }
            }
        }

        if let Some(read) = core.parked_read.take() {
            if !core.buf.is_empty() {
                let n = read.max.min(core.buf.len());
                let data = core.buf.split_to(n).freeze();
                out.push((read.completion, true, Some(data), 0));
                moved = true;
            } else if core.aborted {
                out.push((read.completion, true, None, libc::ECONNRESET));
                moved = true;
            } else if core.eof {
                out.push((read.completion, true, None, 0));
                moved = true;
            } else {
                core.parked_read = Some(read);
            }
        }

        if !moved {
            break;
        }
    }
}

fn fire(firings: Vec<Firing>) {
    for (completion, done, data, errno) in firings {
        completion(done, data, errno);
    }
}

/// One endpoint of an in-memory duplex byte stream.
#[derive(Clone)]
pub struct MemTransport {
    rx: Arc<Mutex<PipeCore>>,
    tx: Arc<Mutex<PipeCore>>,
    /// Writes remaining before injected failures begin. `None` disables.
    write_faults: Arc<Mutex<Option<u64>>>,
}

/// Create a cross-wired endpoint pair with the given per-direction
/// capacity.
pub fn pair(capacity: usize) -> (MemTransport, MemTransport) {
    let a_to_b = Arc::new(Mutex::new(PipeCore::new(capacity)));
    let b_to_a = Arc::new(Mutex::new(PipeCore::new(capacity)));
    let a = MemTransport {
        rx: b_to_a.clone(),
        tx: a_to_b.clone(),
        write_faults: Arc::new(Mutex::new(None)),
    };
    let b = MemTransport {
        rx: a_to_b,
        tx: b_to_a,
        write_faults: Arc::new(Mutex::new(None)),
    };
    (a, b)
}

impl MemTransport {
    /// Let `n` more writes succeed, then fail every later write with
    /// `EIO` without transferring any bytes.
    pub fn fail_writes_after(&self, n: u64) {
        *self.write_faults.lock() = Some(n);
    }

    /// Bytes currently queued toward the peer.
    pub fn queued(&self) -> usize {
        self.tx.lock().buf.len()
    }

    fn take_write_fault(&self) -> bool {
        let mut faults = self.write_faults.lock();
        match *faults {
            Some(0) => true,
            Some(ref mut remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }
}

impl Transport for MemTransport {
    fn read(&self, max: usize, completion: IoCompletion) {
        let mut out = Vec::new();
        {
            let mut core = self.rx.lock();
            debug_assert!(
                core.parked_read.is_none(),
                "one outstanding read at a time"
            );
            core.parked_read = Some(ParkedRead {
                max: max.max(1),
                completion,
            });
            advance(&mut core, &mut out);
        }
        fire(out);
    }

    fn write(&self, data: Bytes, completion: IoCompletion) {
        if self.take_write_fault() {
            completion(true, None, libc::EIO);
            return;
        }
        let mut out = Vec::new();
        {
            let mut core = self.tx.lock();
            if core.eof || core.aborted {
                out.push((completion, true, None, libc::EPIPE));
            } else {
                debug_assert!(
                    core.parked_write.is_none(),
                    "one outstanding write at a time"
                );
                core.parked_write = Some(ParkedWrite { data, completion });
                advance(&mut core, &mut out);
            }
        }
        fire(out);
    }

    fn close(&self, stop: bool) {
        let mut out = Vec::new();
        {
            let mut core = self.tx.lock();
            if stop {
                core.aborted = true;
                core.buf.clear();
            } else {
                core.eof = true;
            }
            advance(&mut core, &mut out);
        }
        {
            let mut core = self.rx.lock();
            // The closer is done reading either way; cancel its parked
            // read so the completion is not stranded.
            if let Some(read) = core.parked_read.take() {
                out.push((read.completion, true, None, libc::ECANCELED));
            }
            if stop {
                core.aborted = true;
                core.buf.clear();
            }
            advance(&mut core, &mut out);
        }
        fire(out);
    }
}
