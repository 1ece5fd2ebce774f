//! Error types for host-issued calls.

use std::fmt;

use tether_protocol::ExceptionBody;

/// Why a pending call was cancelled.
///
/// Callers should treat every reason the same way (the call is over and
/// no result will come); the reason exists for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired, or the call future was
    /// dropped.
    Explicit,
    /// No reply arrived before the configured timeout.
    TimedOut,
    /// The peer sent `ready`, so its side of the call no longer exists.
    PeerReset,
    /// The peer reported the call as cancelled.
    Peer,
    /// The messenger shut down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Explicit => "cancelled by caller",
            Self::TimedOut => "timed out",
            Self::PeerReset => "peer was reset",
            Self::Peer => "cancelled by peer",
            Self::Shutdown => "messenger shut down",
        };
        f.write_str(text)
    }
}

/// How a host-issued call can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The peer's handler raised an error.
    #[error("peer invocation failed: {0}")]
    Peer(ExceptionBody),

    /// The call was cancelled before a reply arrived.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// A call with the same correlation id is already in flight.
    #[error("call id '{0}' is already pending")]
    DuplicateId(String),
}

impl CallError {
    /// `true` for every kind of cancellation, timeouts included.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The cancellation reason, if this is a cancellation.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// The peer's exception, if the peer raised one.
    pub fn exception(&self) -> Option<&ExceptionBody> {
        match self {
            Self::Peer(body) => Some(body),
            _ => None,
        }
    }
}
