//! The TLS channel engine.
//!
//! `SecureChannel` pairs application plaintext requests with a TLS
//! session driven against in-memory ciphertext buffers, and pumps
//! ciphertext to and from an asynchronous transport. Its public surface
//! mirrors the transport's own (`read`/`write`/`close`/`set_low_water`),
//! so an encrypted channel is substitutable for a plain one.
//!
//! All state for a channel mutates on its serial context: public calls
//! and transport completions enqueue events into a per-channel mailbox,
//! and whichever caller finds the mailbox idle becomes the drainer. The
//! drainer applies events, runs the `step` loop to quiescence, and then
//! executes the staged side-effects (request completions, transport
//! operations, cleanup) outside the lock, in order, repeating until the
//! mailbox is empty. Handlers therefore never run concurrently for one
//! channel, and may re-enter the channel API freely.
//!
//! `step` makes forward progress on shutdown, then on the head of each
//! request FIFO, then re-arms the ciphertext pumps, iterating while a
//! completed request leaves more head-of-queue work behind. The engine
//! never blocks: it suspends by returning with transport operations in
//! flight, and resumes when their completions land in the mailbox.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ChannelConfig, Side};
use crate::error::Error;
use crate::session::TlsSession;
use crate::shutdown::ShutdownState;
use crate::transport::{Errno, IoCompletion, Transport};

/// Completion for channel teardown. Fires exactly once, with errno 0 on
/// clean close and `EIO` on a forced or error close.
pub type CleanupCompletion = Box<dyn FnOnce(Errno) + Send>;

struct ReadRequest {
    buf: BytesMut,
    completion: IoCompletion,
}

struct WriteRequest {
    data: Bytes,
    completion: IoCompletion,
}

/// Everything that can land in a channel's mailbox.
enum Event {
    /// Run `step` with no other state change.
    Kick,
    Read {
        length: usize,
        completion: IoCompletion,
    },
    Write {
        data: Bytes,
        completion: IoCompletion,
    },
    Close {
        force: bool,
    },
    CiphertextRead {
        done: bool,
        data: Option<Bytes>,
        errno: Errno,
    },
    CiphertextWritten {
        done: bool,
        errno: Errno,
    },
}

/// Side-effects staged under the lock, executed outside it in order.
enum Effect {
    Complete {
        completion: IoCompletion,
        done: bool,
        data: Option<Bytes>,
        errno: Errno,
    },
    StartRead {
        max: usize,
    },
    StartWrite {
        data: Bytes,
    },
    CloseTransport {
        stop: bool,
    },
    Cleanup {
        completion: CleanupCompletion,
        errno: Errno,
    },
}

struct Inner {
    session: TlsSession,
    transport: Arc<dyn Transport>,
    pending_reads: VecDeque<ReadRequest>,
    pending_writes: VecDeque<WriteRequest>,
    reading_ciphertext: bool,
    writing_ciphertext: bool,
    shutdown: ShutdownState,
    /// First error observed; sticky.
    error: Option<Error>,
    cleanup: Option<CleanupCompletion>,
    /// Set while a clean close waits on the final egress flush.
    closing_errno: Option<Errno>,
    mailbox: VecDeque<Event>,
    effects: Vec<Effect>,
    draining: bool,
}

struct Shared {
    inner: Mutex<Inner>,
}

/// A TLS-encrypted byte-stream channel over an injected transport.
pub struct SecureChannel {
    shared: Arc<Shared>,
}

impl SecureChannel {
    /// Take ownership of `transport`, start the handshake, and begin
    /// reading ciphertext. `cleanup` fires exactly once when the channel
    /// is fully closed.
    pub fn open<T, F>(
        transport: T,
        side: Side,
        config: ChannelConfig,
        cleanup: F,
    ) -> Result<SecureChannel, Error>
    where
        T: Transport + 'static,
        F: FnOnce(Errno) + Send + 'static,
    {
        let session = TlsSession::new(side, config.ciphertext_soft_cap)?;
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                session,
                transport: Arc::new(transport),
                pending_reads: VecDeque::new(),
                pending_writes: VecDeque::new(),
                reading_ciphertext: false,
                writing_ciphertext: false,
                shutdown: ShutdownState::Open,
                error: None,
                cleanup: Some(Box::new(cleanup)),
                closing_errno: None,
                mailbox: VecDeque::new(),
                effects: Vec::new(),
                draining: false,
            }),
        });
        dispatch(&shared, Event::Kick);
        Ok(SecureChannel { shared })
    }

    /// Enqueue a read for up to `length` plaintext bytes. The completion
    /// fires with the bytes actually read, `None` on EOF, or an errno.
    /// Reads complete in the order enqueued.
    pub fn read<F>(&self, length: usize, completion: F)
    where
        F: FnOnce(bool, Option<Bytes>, Errno) + Send + 'static,
    {
        dispatch(
            &self.shared,
            Event::Read {
                length,
                completion: Box::new(completion),
            },
        );
    }

    /// Enqueue a write. The completion fires once the entire payload has
    /// been absorbed by the TLS engine. Writes complete in the order
    /// enqueued.
    pub fn write<D, F>(&self, data: D, completion: F)
    where
        D: Into<Bytes>,
        F: FnOnce(bool, Option<Bytes>, Errno) + Send + 'static,
    {
        dispatch(
            &self.shared,
            Event::Write {
                data: data.into(),
                completion: Box::new(completion),
            },
        );
    }

    /// Initiate shutdown. `force` abandons the connection with `EIO` if
    /// the close_notify exchange cannot complete immediately.
    pub fn close(&self, force: bool) {
        dispatch(&self.shared, Event::Close { force });
    }

    /// Present for interface compatibility with the plain transport;
    /// silently ignored.
    pub fn set_low_water(&self, _n: usize) {}

    /// Whether the TLS handshake has completed.
    pub fn handshake_complete(&self) -> bool {
        self.shared.inner.lock().session.handshake_complete()
    }

    /// Current shutdown progress.
    pub fn shutdown_state(&self) -> ShutdownState {
        self.shared.inner.lock().shutdown
    }

    /// Ciphertext bytes queued toward the transport.
    pub fn egress_buffered(&self) -> usize {
        self.shared.inner.lock().session.egress_buffered()
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        let open = !self.shared.inner.lock().shutdown.is_closed();
        if open {
            dispatch(&self.shared, Event::Close { force: true });
        }
    }
}

/// Enqueue an event; become the drainer if nobody else is.
fn dispatch(shared: &Arc<Shared>, event: Event) {
    {
        let mut inner = shared.inner.lock();
        inner.mailbox.push_back(event);
        if inner.draining {
            return;
        }
        inner.draining = true;
    }
    drain(shared);
}

/// Apply events and run `step` under the lock; execute staged effects
/// outside it. Loops until the mailbox is quiet.
fn drain(shared: &Arc<Shared>) {
    loop {
        let effects = {
            let mut inner = shared.inner.lock();
            while let Some(event) = inner.mailbox.pop_front() {
                inner.apply(event);
            }
            inner.step();
            if inner.effects.is_empty() && inner.mailbox.is_empty() {
                inner.draining = false;
                return;
            }
            std::mem::take(&mut inner.effects)
        };
        for effect in effects {
            run_effect(shared, effect);
        }
    }
}

fn run_effect(shared: &Arc<Shared>, effect: Effect) {
    match effect {
        Effect::Complete {
            completion,
            done,
            data,
            errno,
        } => completion(done, data, errno),
        Effect::StartRead { max } => {
            let transport = shared.inner.lock().transport.clone();
            let weak = Arc::downgrade(shared);
            transport.read(
                max,
                Box::new(move |done, data, errno| {
                    if let Some(shared) = weak.upgrade() {
                        dispatch(&shared, Event::CiphertextRead { done, data, errno });
                    }
                }),
            );
        }
        Effect::StartWrite { data } => {
            let transport = shared.inner.lock().transport.clone();
            let weak = Arc::downgrade(shared);
            transport.write(
                data,
                Box::new(move |done, _data, errno| {
                    if let Some(shared) = weak.upgrade() {
                        dispatch(&shared, Event::CiphertextWritten { done, errno });
                    }
                }),
            );
        }
        Effect::CloseTransport { stop } => {
            let transport = shared.inner.lock().transport.clone();
            transport.close(stop);
        }
        Effect::Cleanup { completion, errno } => completion(errno),
    }
}

impl Inner {
    fn apply(&mut self, event: Event) {
        match event {
            Event::Kick => {}
            Event::Read { length, completion } => {
                if self.error.is_some() || self.shutdown.is_closed() {
                    let errno = self.failure_errno();
                    self.stage_complete(completion, true, None, errno);
                } else if length == 0 {
                    self.stage_complete(completion, true, Some(Bytes::new()), 0);
                } else {
                    self.pending_reads.push_back(ReadRequest {
                        buf: BytesMut::zeroed(length),
                        completion,
                    });
                }
            }
            Event::Write { data, completion } => {
                if self.error.is_some() || !self.shutdown.accepts_writes() {
                    let errno = self.failure_errno();
                    self.stage_complete(completion, true, None, errno);
                } else if data.is_empty() {
                    self.stage_complete(completion, true, None, 0);
                } else {
                    self.pending_writes.push_back(WriteRequest { data, completion });
                }
            }
            Event::Close { force } => {
                let next = self.shutdown.request(force);
                if next != self.shutdown {
                    debug!(force, "close requested");
                    self.shutdown = next;
                }
            }
            Event::CiphertextRead { done, data, errno } => {
                if done {
                    self.reading_ciphertext = false;
                }
                if self.shutdown.is_closed() {
                    return;
                }
                if errno != 0 {
                    self.latch(Error::Transport(errno));
                    return;
                }
                match data {
                    Some(batch) if !batch.is_empty() => self.session.write_ingress(&batch),
                    _ => {
                        // Transport EOF. The flag stays set so no further
                        // reads are issued; the session decides whether
                        // the close was clean.
                        self.reading_ciphertext = true;
                        self.session.mark_ingress_eof();
                    }
                }
            }
            Event::CiphertextWritten { done, errno } => {
                if done {
                    self.writing_ciphertext = false;
                }
                if self.shutdown.is_closed() {
                    if errno != 0 && self.closing_errno == Some(0) {
                        // The final flush failed; fall back to a stop
                        // close.
                        self.closing_errno = Some(Error::Transport(errno).errno());
                    }
                    return;
                }
                if errno != 0 {
                    self.latch(Error::Transport(errno));
                }
            }
        }
    }

    /// Run until no sub-step makes progress.
    fn step(&mut self) {
        if self.error.is_some() {
            let errno = self.failure_errno();
            self.finish_close(errno);
            return;
        }
        loop {
            let mut more = false;
            match self.shutdown {
                ShutdownState::Closed => {}
                ShutdownState::ShutdownSent => {
                    // The send direction is closed, but close_notify only
                    // half-closes: keep serving reads until the peer's
                    // alert arrives.
                    more = self.read_substep();
                    if matches!(self.shutdown, ShutdownState::ShutdownSent)
                        && self.error.is_none()
                    {
                        match self.session.poll_close() {
                            Ok(true) => self.note_close_notify(),
                            Ok(false) => {}
                            Err(e) => self.latch(e),
                        }
                    }
                }
                ShutdownState::ShutdownRequested { force } => self.shutdown_substep(force),
                ShutdownState::Open => {
                    let read_more = self.read_substep();
                    let write_more = self.write_substep();
                    more = read_more || write_more;
                }
            }
            if self.error.is_some() {
                let errno = self.failure_errno();
                self.finish_close(errno);
                return;
            }
            self.try_read_ciphertext();
            self.try_write_ciphertext();
            if self.shutdown.is_closed() {
                self.maybe_complete_close();
            }
            if !more {
                break;
            }
        }
    }

    /// Attempt the head-of-queue plaintext read. Returns whether further
    /// head-of-queue progress may be possible.
    fn read_substep(&mut self) -> bool {
        let Some(front) = self.pending_reads.front_mut() else {
            return false;
        };
        let result = self.session.read_plaintext(front.buf.as_mut());
        match result {
            Ok(None) => false,
            Ok(Some(0)) => {
                if let Some(req) = self.pending_reads.pop_front() {
                    self.stage_complete(req.completion, true, None, 0);
                }
                self.note_close_notify();
                // Later reads observe EOF the same way, one per step
                // iteration.
                !self.pending_reads.is_empty()
            }
            Ok(Some(n)) => {
                if let Some(mut req) = self.pending_reads.pop_front() {
                    let data = req.buf.split_to(n).freeze();
                    self.stage_complete(req.completion, true, Some(data), 0);
                }
                !self.pending_reads.is_empty()
            }
            Err(e) => {
                self.latch(e);
                false
            }
        }
    }

    /// Attempt the head-of-queue plaintext write. Returns whether further
    /// head-of-queue progress may be possible.
    fn write_substep(&mut self) -> bool {
        if self.session.egress_available() == 0 {
            return false;
        }
        let Some(front) = self.pending_writes.front() else {
            return false;
        };
        let result = self.session.write_plaintext(&front.data);
        match result {
            Ok(None) => false,
            Ok(Some(0)) => {
                if let Some(req) = self.pending_writes.pop_front() {
                    self.stage_complete(req.completion, true, Some(req.data), 0);
                }
                self.note_close_notify();
                !self.pending_writes.is_empty()
            }
            Ok(Some(_)) => {
                // Partial absorption is disabled in the engine; the whole
                // payload went in.
                if let Some(req) = self.pending_writes.pop_front() {
                    self.stage_complete(req.completion, true, None, 0);
                }
                !self.pending_writes.is_empty()
            }
            Err(e) => {
                self.latch(e);
                false
            }
        }
    }

    /// Advance the close_notify exchange.
    fn shutdown_substep(&mut self, force: bool) {
        match self.session.shutdown() {
            Ok(true) => self.finish_close(0),
            Ok(false) if force => {
                // The peer's alert may have arrived in the interim; one
                // more attempt before abandoning the connection.
                match self.session.shutdown() {
                    Ok(true) => self.finish_close(0),
                    Ok(false) => {
                        let errno = self.failure_errno();
                        self.finish_close(errno);
                    }
                    Err(e) => self.latch(e),
                }
            }
            Ok(false) => {
                debug!("close_notify sent, awaiting peer");
                self.shutdown = ShutdownState::ShutdownSent;
            }
            Err(e) => self.latch(e),
        }
    }

    /// The peer's close_notify was observed on a plaintext operation.
    fn note_close_notify(&mut self) {
        match self.shutdown {
            ShutdownState::ShutdownSent => self.finish_close(0),
            ShutdownState::Closed => {}
            _ => {
                // Read direction closed; half-close is permitted, so the
                // host must still call close to finish the exchange.
            }
        }
    }

    /// Transition to `Closed`: complete every remaining request exactly
    /// once, then close the transport and fire cleanup. A clean close
    /// first flushes the final egress (the close_notify alert).
    fn finish_close(&mut self, errno: Errno) {
        if !self.shutdown.is_closed() {
            self.shutdown = ShutdownState::Closed;
            if let Some(e) = &self.error {
                debug!(error = %e, "closing after error");
            }
            while let Some(req) = self.pending_reads.pop_front() {
                self.stage_complete(req.completion, true, None, errno);
            }
            // A write never absorbed by the engine cannot be claimed
            // delivered, clean close or not.
            let write_errno = if errno == 0 { self.failure_errno() } else { errno };
            while let Some(req) = self.pending_writes.pop_front() {
                self.stage_complete(req.completion, true, None, write_errno);
            }
            self.closing_errno = Some(errno);
            if errno == 0 {
                self.try_write_ciphertext();
            }
        } else if errno != 0 && self.closing_errno == Some(0) {
            self.closing_errno = Some(errno);
        }
        self.maybe_complete_close();
    }

    /// Close the transport and fire cleanup once any final flush has
    /// drained.
    fn maybe_complete_close(&mut self) {
        let Some(errno) = self.closing_errno else {
            return;
        };
        if errno == 0 && (self.writing_ciphertext || self.session.egress_buffered() > 0) {
            return;
        }
        self.closing_errno = None;
        self.effects.push(Effect::CloseTransport { stop: errno != 0 });
        if let Some(completion) = self.cleanup.take() {
            self.effects.push(Effect::Cleanup { completion, errno });
        }
        debug!(errno, "channel closed");
    }

    /// Latch the first error observed.
    fn latch(&mut self, error: Error) {
        if self.error.is_none() {
            debug!(error = %error, "error latched");
            self.error = Some(error);
        }
    }

    /// Boundary errno for a failed or abandoned channel: the latched
    /// error's errno, or `EIO` when a forced close abandoned the
    /// connection without one.
    fn failure_errno(&self) -> Errno {
        self.error.as_ref().map_or(libc::EIO, Error::errno)
    }

    /// Re-arm the transport read when the ingress buffer has room.
    fn try_read_ciphertext(&mut self) {
        if self.reading_ciphertext || self.error.is_some() || self.shutdown.is_closed() {
            return;
        }
        let space = self.session.ingress_available();
        if space == 0 {
            return;
        }
        self.reading_ciphertext = true;
        self.effects.push(Effect::StartRead { max: space });
    }

    /// Re-arm the transport write when egress holds ciphertext.
    fn try_write_ciphertext(&mut self) {
        if self.writing_ciphertext || self.error.is_some() {
            return;
        }
        if self.shutdown.is_closed() && self.closing_errno != Some(0) {
            return;
        }
        let Some(data) = self.session.take_egress() else {
            return;
        };
        self.writing_ciphertext = true;
        self.effects.push(Effect::StartWrite { data });
    }

    fn stage_complete(
        &mut self,
        completion: IoCompletion,
        done: bool,
        data: Option<Bytes>,
        errno: Errno,
    ) {
        self.effects.push(Effect::Complete {
            completion,
            done,
            data,
            errno,
        });
    }
}
