//! Trampolines for peer-side functions.
//!
//! When the peer passes a function as an argument, the host receives a
//! token like `__peerClosures__.closure_$3`. A [`PeerClosure`] wraps that
//! token; calling it sends an `invoke` named by the token and awaits the
//! correlated reply like any other host-issued call.
//!
//! Clones share one handle. When the last clone is dropped the host sends
//! a `discard` control message so the peer can let go of the function.

use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_protocol::control;

use crate::marshal::convert;
use crate::messenger::Inner;
use crate::{Arg, ConversionError, Messenger, Position, TetherError};

struct ClosureHandle {
    token: String,
    messenger: Weak<Inner>,
}

impl Drop for ClosureHandle {
    fn drop(&mut self) {
        let Some(inner) = self.messenger.upgrade() else {
            return;
        };
        let messenger = Messenger::from_inner(inner);
        if let Err(e) = messenger.send_control(control::DISCARD, Some(Value::from(self.token.as_str()))) {
            tracing::debug!(token = %self.token, error = %e, "discard not sent");
        }
    }
}

/// A callable stand-in for a function that lives on the peer.
#[derive(Clone)]
pub struct PeerClosure {
    handle: Arc<ClosureHandle>,
    arity: Option<usize>,
}

impl PeerClosure {
    /// Largest number of arguments a closure may be declared with.
    pub const MAX_ARITY: usize = 6;

    pub(crate) fn new(token: String, messenger: Weak<Inner>) -> Self {
        Self {
            handle: Arc::new(ClosureHandle { token, messenger }),
            arity: None,
        }
    }

    /// The peer's token for this function.
    pub fn token(&self) -> &str {
        &self.handle.token
    }

    /// Declares how many arguments the function takes. Every later call
    /// is checked against it.
    ///
    /// # Errors
    /// [`ConversionError::ArityTooLarge`] above [`Self::MAX_ARITY`].
    pub fn with_arity(mut self, arity: usize) -> Result<Self, ConversionError> {
        if arity > Self::MAX_ARITY {
            return Err(ConversionError::ArityTooLarge {
                actual: arity,
                max: Self::MAX_ARITY,
            });
        }
        self.arity = Some(arity);
        Ok(self)
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    /// Calls the peer function and returns its raw result.
    pub async fn call(&self, args: Vec<Arg>) -> Result<Option<Value>, TetherError> {
        self.check_arity(args.len())?;
        let inner = self.handle.messenger.upgrade().ok_or(TetherError::Closed)?;
        Messenger::from_inner(inner)
            .invoke_peer(&self.handle.token, args)
            .await
    }

    /// Calls the peer function and converts its result into `R`.
    pub async fn call_as<R: DeserializeOwned>(&self, args: Vec<Arg>) -> Result<R, TetherError> {
        let value = self.call(args).await?;
        Ok(convert(value.unwrap_or(Value::Null), Position::Result)?)
    }

    fn check_arity(&self, actual: usize) -> Result<(), ConversionError> {
        match self.arity {
            Some(expected) if expected != actual => {
                Err(ConversionError::ArityMismatch { expected, actual })
            }
            None if actual > Self::MAX_ARITY => Err(ConversionError::ArityTooLarge {
                actual,
                max: Self::MAX_ARITY,
            }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for PeerClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClosure")
            .field("token", &self.handle.token)
            .field("arity", &self.arity)
            .finish()
    }
}
