//! Typed errors surfaced to applications using this crate.

use std::fmt;

use crate::message::Token;

/// Why a session's incoming datagram could not be turned into a [`Message`](crate::message::Message).
///
/// Parse errors never propagate out of the [`Listener`](crate::Listener):
/// the offending datagram is dropped and the reason is logged at `debug`
/// level. The type is public so unit tests can assert on the exact failure.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram of {0} bytes exceeds the maximum of {1}")]
    TooLarge(usize, usize),
    #[error("packet does not start with '/'")]
    MissingLeadingSlash,
    #[error("packet does not end with '/'")]
    MissingTrailingSlash,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("field {0} is empty")]
    EmptyField(&'static str),
    #[error("field {0} is not a valid non-negative 32-bit integer")]
    InvalidInteger(&'static str),
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
    #[error("payload ends with a dangling escape character")]
    DanglingEscape,
    #[error("packet has trailing data after the final field")]
    TrailingData,
}

/// Why a [`Connection`](crate::Connection)'s read or write failed.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The session is closed; no further reads or writes are possible.
    #[error("the session is closed")]
    Closed,
    /// The write would push the session's cumulative send offset past what
    /// fits in the wire format's signed 32-bit `pos` field.
    #[error("write would exceed the protocol's 32-bit stream offset limit")]
    StreamOverflow,
}

/// Why [`Listener::accept`](crate::Listener::accept) failed.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ListenerError {
    /// The listener has been closed and will never produce another session.
    #[error("the listener is closed")]
    Closed,
}

/// Why the [`Listener`](crate::Listener)'s demultiplexer couldn't route an
/// inbound datagram to a session. Logged at `debug` level; never propagated
/// to the application, since an unroutable datagram isn't actionable beyond
/// replying `Close` to the sender.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DemuxError {
    /// A non-`Connect` message named a token with no live session.
    #[error("no session for token {0}")]
    UnknownSession(Token),
}

/// Why a session was torn down unilaterally rather than at the
/// application's request. Logged at `debug` level alongside the
/// [`CloseReason`] that also covers the non-error shutdown paths
/// (`LocalClose`, `PeerClose`, `ListenerShutdown`).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The peer acknowledged bytes the session never sent.
    #[error("peer acknowledged bytes that were never sent")]
    PeerViolation,
    /// No inbound datagram arrived within the configured idle timeout.
    #[error("no inbound datagram arrived within the idle timeout")]
    IdleTimeout,
}

/// Why a session transitioned to `Closed`. Carried only for diagnostics and
/// logging; the application only ever observes EOF / `ConnectionError::Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The application called `Connection::close`.
    LocalClose,
    /// The peer sent a `Close` message.
    PeerClose,
    /// The peer acknowledged bytes it could never have been sent.
    PeerViolation,
    /// No inbound datagram arrived within the configured idle timeout.
    IdleTimeout,
    /// The listener was closed, tearing down every live session.
    ListenerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::LocalClose => "local close",
            CloseReason::PeerClose => "peer close",
            CloseReason::PeerViolation => "peer protocol violation",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::ListenerShutdown => "listener shutdown",
        };
        f.write_str(s)
    }
}
