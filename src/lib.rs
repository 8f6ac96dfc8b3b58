//! Streaming TLS for completion-based byte transports.
//!
//! `tlsio` bridges two APIs that refuse to meet in the middle: a
//! synchronous, memory-oriented TLS engine (rustls, whose calls
//! would-block and expect to be retried) and an asynchronous,
//! callback-driven byte-stream transport. A [`SecureChannel`] accepts
//! plaintext read/write requests, performs record encryption against
//! in-memory ciphertext buffers, and pumps ciphertext through the
//! injected [`Transport`], with flow control and orderly half-close.
//!
//! The channel's surface mirrors the transport's, so an encrypted
//! channel drops in wherever a plain one is expected.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod shutdown;
pub mod transport;

// Public API re-exports
pub use buffer::{CiphertextBuffer, DEFAULT_SOFT_CAP};
pub use channel::{CleanupCompletion, SecureChannel};
pub use config::{ChannelConfig, Side, TlsClientConfig, TlsConfig};
pub use error::Error;
pub use session::TlsSession;
pub use shutdown::ShutdownState;
pub use transport::mem::MemTransport;
pub use transport::{Errno, IoCompletion, Transport};
