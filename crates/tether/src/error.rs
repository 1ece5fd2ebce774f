//! Unified error type for Tether, plus value-conversion errors.

use std::fmt;

use tether_pending::CallError;
use tether_protocol::{ExceptionBody, ProtocolError};
use tether_registry::RegistryError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates the `From` impl, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Encoding or decoding a frame failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A method could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A host-issued call failed: the peer raised, or the call was
    /// cancelled or timed out.
    #[error(transparent)]
    Call(#[from] CallError),

    /// The connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An argument or result had the wrong shape.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The messenger was shut down or its outbound channel is gone.
    #[error("messenger is closed")]
    Closed,
}

impl TetherError {
    /// `true` if the call was cancelled for any reason, timeouts included.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Call(e) if e.is_cancelled())
    }

    /// The peer's exception, if the peer's handler raised one.
    pub fn exception(&self) -> Option<&ExceptionBody> {
        match self {
            Self::Call(e) => e.exception(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConversionError
// ---------------------------------------------------------------------------

/// Where a value that failed to convert came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Positional argument, zero-based.
    Argument(usize),
    /// The return value of a call.
    Result,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(index) => write!(f, "argument {index}"),
            Self::Result => f.write_str("result"),
        }
    }
}

/// A value crossing the boundary did not have the declared shape.
///
/// Conversions never coerce: a string is not a number, a plain object is
/// not a closure.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{position}: expected {expected}, got {actual}")]
    TypeMismatch {
        position: Position,
        expected: String,
        actual: String,
    },

    #[error("{position}: byte array is not valid base64: {source}")]
    Encoding {
        position: Position,
        #[source]
        source: base64::DecodeError,
    },

    #[error("closure arity {actual} exceeds the maximum of {max}")]
    ArityTooLarge { actual: usize, max: usize },

    #[error("closure declared {expected} arguments but was called with {actual}")]
    ArityMismatch { expected: usize, actual: usize },
}

impl ConversionError {
    /// Where the offending value was.
    pub fn position(&self) -> Option<Position> {
        match self {
            Self::TypeMismatch { position, .. } | Self::Encoding { position, .. } => {
                Some(*position)
            }
            _ => None,
        }
    }
}
