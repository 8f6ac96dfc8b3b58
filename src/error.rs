use std::fmt;
use std::io;

/// Errors observed while driving a TLS channel.
///
/// The channel latches the first error it sees and fails every pending
/// request with the boundary errno; the variants below exist for logging
/// and tests, not for the caller-facing boundary, which is errno-only.
#[derive(Debug)]
pub enum Error {
    /// The TLS engine reported a protocol failure.
    Protocol(rustls::Error),
    /// An engine return the adapter did not classify.
    Unexpected(io::Error),
    /// The transport closed without a close_notify alert.
    UncleanClose,
    /// The transport reported a non-zero errno.
    Transport(i32),
}

impl Error {
    /// The errno surfaced at the channel boundary.
    ///
    /// TLS-originated failures are deliberately collapsed to `EIO`;
    /// protocol diagnostics are logged, never passed up.
    pub fn errno(&self) -> i32 {
        libc::EIO
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "TLS protocol error: {e}"),
            Error::Unexpected(e) => write!(f, "unexpected TLS engine result: {e}"),
            Error::UncleanClose => write!(f, "transport closed without close_notify"),
            Error::Transport(errno) => write!(f, "transport error: errno {errno}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(e) => Some(e),
            Error::Unexpected(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn every_variant_surfaces_eio() {
        assert_eq!(
            Error::Protocol(rustls::Error::HandshakeNotComplete).errno(),
            libc::EIO
        );
        assert_eq!(
            Error::Unexpected(io::Error::other("code 7")).errno(),
            libc::EIO
        );
        assert_eq!(Error::UncleanClose.errno(), libc::EIO);
        assert_eq!(Error::Transport(libc::ECONNRESET).errno(), libc::EIO);
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::Transport(libc::EPIPE);
        assert!(e.to_string().contains(&libc::EPIPE.to_string()));
        let e = Error::Unexpected(io::Error::other("alert received"));
        assert!(e.to_string().contains("alert received"));
    }

    #[test]
    fn engine_errors_chain_their_source() {
        assert!(Error::Protocol(rustls::Error::HandshakeNotComplete)
            .source()
            .is_some());
        assert!(Error::Unexpected(io::Error::other("bad length"))
            .source()
            .is_some());
        assert!(Error::UncleanClose.source().is_none());
        assert!(Error::Transport(libc::EPIPE).source().is_none());
    }
}
