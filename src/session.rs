//! In-memory TLS adapter.
//!
//! `TlsSession` owns one rustls connection and a pair of ciphertext
//! buffers. Plaintext reads and writes run against caller buffers while
//! ciphertext flows through `ingress` (from the transport) and `egress`
//! (to the transport); the session itself never touches a socket. Every
//! plaintext call implicitly drives the handshake: until it completes,
//! calls return `None` and leave ciphertext in the buffers for the
//! channel to pump.

use std::io::{self, Read, Write};

use rustls::{ClientConnection, Connection, ServerConnection};
use tracing::debug;

use crate::buffer::CiphertextBuffer;
use crate::config::{self, Side};
use crate::error::Error;

/// A TLS engine driven entirely through in-memory buffers.
pub struct TlsSession {
    conn: Connection,
    ingress: CiphertextBuffer,
    egress: CiphertextBuffer,
    handshake_complete: bool,
    sent_close_notify: bool,
    peer_closed: bool,
    ingress_eof: bool,
    eof_delivered: bool,
}

impl TlsSession {
    /// Create a session for the given side. Client sessions flush their
    /// first handshake flight into `egress` immediately.
    pub fn new(side: Side, soft_cap: usize) -> Result<Self, Error> {
        config::install_provider();
        let conn = match side {
            Side::Client {
                config,
                server_name,
            } => {
                let mut conn = ClientConnection::new(config.client_config, server_name)?;
                // Unlimited internal buffering: a plaintext write is
                // absorbed whole or not at all. Egress back-pressure is
                // enforced by the soft cap instead.
                conn.set_buffer_limit(None);
                Connection::Client(conn)
            }
            Side::Server { config } => {
                let mut conn = ServerConnection::new(config.server_config)?;
                conn.set_buffer_limit(None);
                Connection::Server(conn)
            }
        };
        let mut session = Self {
            conn,
            ingress: CiphertextBuffer::new(soft_cap),
            egress: CiphertextBuffer::new(soft_cap),
            handshake_complete: false,
            sent_close_notify: false,
            peer_closed: false,
            ingress_eof: false,
            eof_delivered: false,
        };
        session.flush_egress()?;
        Ok(session)
    }

    /// Whether the handshake has completed.
    #[inline]
    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Whether the peer's close_notify has been received.
    #[inline]
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Room left in the ingress buffer, as a transport read bound.
    #[inline]
    pub fn ingress_available(&self) -> usize {
        self.ingress.available_space()
    }

    /// Room left in the egress buffer.
    #[inline]
    pub fn egress_available(&self) -> usize {
        self.egress.available_space()
    }

    /// Bytes waiting in the egress buffer.
    #[inline]
    pub fn egress_buffered(&self) -> usize {
        self.egress.used_space()
    }

    /// Append ciphertext received from the transport.
    pub fn write_ingress(&mut self, batch: &[u8]) {
        self.ingress.write(batch);
    }

    /// Drain everything queued for the transport.
    pub fn take_egress(&mut self) -> Option<bytes::Bytes> {
        self.egress.read(None)
    }

    /// Record that the transport hit EOF. The engine learns of it on the
    /// next plaintext call and distinguishes a clean close (close_notify
    /// already seen) from an unclean one.
    pub fn mark_ingress_eof(&mut self) {
        self.ingress_eof = true;
    }

    /// Read plaintext into `into`.
    ///
    /// `Ok(None)` means would-block: more ingress or an egress drain is
    /// needed. `Ok(Some(0))` means the peer sent close_notify.
    /// `Ok(Some(n))` means `n` bytes were filled.
    pub fn read_plaintext(&mut self, into: &mut [u8]) -> Result<Option<usize>, Error> {
        self.advance()?;
        if !self.handshake_complete {
            return Ok(None);
        }
        match self.conn.reader().read(into) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::UncleanClose),
            Err(e) => Err(Error::Unexpected(e)),
        }
    }

    /// Write plaintext from `from`.
    ///
    /// `Ok(None)` means would-block: the handshake is incomplete or
    /// egress needs draining. `Ok(Some(n))` means all `n == from.len()`
    /// bytes were absorbed; partial consumption never occurs. The
    /// caller's buffer is copied at call time and never retained.
    pub fn write_plaintext(&mut self, from: &[u8]) -> Result<Option<usize>, Error> {
        self.advance()?;
        if !self.handshake_complete {
            return Ok(None);
        }
        if self.egress.available_space() == 0 {
            return Ok(None);
        }
        let n = self.conn.writer().write(from).map_err(Error::Unexpected)?;
        debug_assert_eq!(n, from.len(), "engine absorbed a partial write");
        self.flush_egress()?;
        Ok(Some(n))
    }

    /// Attempt to send close_notify. Returns `true` once the peer's
    /// close_notify has also been seen; a later call may complete the
    /// exchange once the peer's alert arrives.
    pub fn shutdown(&mut self) -> Result<bool, Error> {
        self.advance()?;
        if !self.sent_close_notify {
            self.conn.send_close_notify();
            self.sent_close_notify = true;
            debug!("queued close_notify");
        }
        self.flush_egress()?;
        Ok(self.peer_closed)
    }

    /// Process buffered ingress without a plaintext request, reporting
    /// whether the peer has closed. Errors if the transport hit EOF and
    /// no close_notify ever arrived.
    pub fn poll_close(&mut self) -> Result<bool, Error> {
        self.advance()?;
        if self.peer_closed {
            Ok(true)
        } else if self.eof_delivered {
            Err(Error::UncleanClose)
        } else {
            Ok(false)
        }
    }

    /// Feed buffered ingress to the engine, process, and drain pending
    /// records into egress.
    fn advance(&mut self) -> Result<(), Error> {
        loop {
            let mut fed = false;
            if !self.ingress.is_empty() && self.conn.wants_read() {
                // Feeding from an empty reader would register EOF with
                // the engine, so the non-empty check is load-bearing.
                // wants_read() is false while unread plaintext is
                // buffered; leaving ciphertext in ingress then shrinks
                // available_space and throttles the transport.
                let n = {
                    let mut cursor = io::Cursor::new(self.ingress.as_slice());
                    self.conn
                        .read_tls(&mut cursor)
                        .map_err(Error::Unexpected)?
                };
                if n > 0 {
                    self.ingress.consume(n);
                    fed = true;
                }
            } else if self.ingress.is_empty() && self.ingress_eof && !self.eof_delivered {
                // An empty reader registers EOF with the engine.
                let mut empty: &[u8] = &[];
                let _ = self.conn.read_tls(&mut empty).map_err(Error::Unexpected)?;
                self.eof_delivered = true;
                fed = true;
            }
            self.process()?;
            if !fed {
                break;
            }
        }
        self.flush_egress()?;
        if self.eof_delivered && self.conn.is_handshaking() {
            return Err(Error::UncleanClose);
        }
        Ok(())
    }

    fn process(&mut self) -> Result<(), Error> {
        let state = self.conn.process_new_packets().map_err(Error::Protocol)?;
        if state.peer_has_closed() && !self.peer_closed {
            self.peer_closed = true;
            debug!("peer sent close_notify");
        }
        if !self.handshake_complete && !self.conn.is_handshaking() {
            self.handshake_complete = true;
            debug!("handshake complete");
        }
        Ok(())
    }

    fn flush_egress(&mut self) -> Result<(), Error> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut self.egress)
                .map_err(Error::Unexpected)?;
        }
        Ok(())
    }
}
