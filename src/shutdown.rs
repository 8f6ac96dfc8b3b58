//! Half-close coordination.
//!
//! Closing a TLS channel is a two-direction affair: the send direction
//! closes when our close_notify goes out, the receive direction when the
//! peer's arrives. `ShutdownState` tracks where a channel is in that
//! exchange; the channel engine applies the transitions.

/// Shutdown progress for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No shutdown requested.
    Open,
    /// `close` was called; the alert exchange has not finished. A forced
    /// request abandons the connection if the peer's alert is not already
    /// in hand after a second attempt.
    ShutdownRequested { force: bool },
    /// Our close_notify is out; waiting on the peer's. The receive
    /// direction stays open until it arrives.
    ShutdownSent,
    /// Transport closed, cleanup fired. Terminal.
    Closed,
}

impl ShutdownState {
    /// Apply a `close(force)` request.
    ///
    /// Re-requesting with `force` upgrades a pending or sent shutdown so
    /// a stuck peer can be abandoned; everything else is ignored.
    pub fn request(self, force: bool) -> ShutdownState {
        match self {
            ShutdownState::Open => ShutdownState::ShutdownRequested { force },
            ShutdownState::ShutdownRequested { force: earlier } => ShutdownState::ShutdownRequested {
                force: earlier || force,
            },
            ShutdownState::ShutdownSent if force => {
                ShutdownState::ShutdownRequested { force: true }
            }
            other => other,
        }
    }

    /// Whether the channel has fully closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, ShutdownState::Closed)
    }

    /// Whether the send direction is still accepting plaintext writes.
    #[inline]
    pub fn accepts_writes(&self) -> bool {
        matches!(self, ShutdownState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_from_open() {
        assert_eq!(
            ShutdownState::Open.request(false),
            ShutdownState::ShutdownRequested { force: false }
        );
        assert_eq!(
            ShutdownState::Open.request(true),
            ShutdownState::ShutdownRequested { force: true }
        );
    }

    #[test]
    fn force_upgrades_pending_request() {
        let pending = ShutdownState::ShutdownRequested { force: false };
        assert_eq!(
            pending.request(true),
            ShutdownState::ShutdownRequested { force: true }
        );
        // A later plain close never downgrades a forced one.
        let forced = ShutdownState::ShutdownRequested { force: true };
        assert_eq!(
            forced.request(false),
            ShutdownState::ShutdownRequested { force: true }
        );
    }

    #[test]
    fn plain_close_after_alert_sent_is_ignored() {
        assert_eq!(
            ShutdownState::ShutdownSent.request(false),
            ShutdownState::ShutdownSent
        );
    }

    #[test]
    fn force_close_after_alert_sent_advances() {
        assert_eq!(
            ShutdownState::ShutdownSent.request(true),
            ShutdownState::ShutdownRequested { force: true }
        );
    }

    #[test]
    fn closed_is_terminal() {
        assert_eq!(ShutdownState::Closed.request(false), ShutdownState::Closed);
        assert_eq!(ShutdownState::Closed.request(true), ShutdownState::Closed);
        assert!(ShutdownState::Closed.is_closed());
    }

    #[test]
    fn only_open_accepts_writes() {
        assert!(ShutdownState::Open.accepts_writes());
        assert!(!ShutdownState::ShutdownSent.accepts_writes());
        assert!(!ShutdownState::ShutdownRequested { force: false }.accepts_writes());
        assert!(!ShutdownState::Closed.accepts_writes());
    }
}
