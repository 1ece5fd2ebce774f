//! Typed-value marshaling.
//!
//! Three kinds of value cross the boundary inside a
//! [`TypedValue`](tether_protocol::TypedValue) wrapper instead of as plain
//! JSON:
//!
//! | kind          | host → peer                 | peer → host                |
//! |---------------|-----------------------------|----------------------------|
//! | `byteArray`   | [`Arg::Bytes`]              | [`Args::bytes`]            |
//! | `closure`     | [`Arg::Closure`]            | [`Args::closure`]          |
//! | `abortSignal` | [`Arg::Abort`]              | [`Args::abort_signal`]     |
//!
//! Every conversion takes the messenger explicitly (through [`Args`] on
//! the way in, through the call on the way out); there is no ambient
//! "current messenger".

use std::sync::{Arc, Mutex, PoisonError, Weak};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_protocol::{AbortSignalBody, TypedValue, TypedValueKind};
use tether_registry::{MethodMetadata, RegistryError};
use tokio_util::sync::CancellationToken;

use crate::handler::short_type_name;
use crate::messenger::Inner;
use crate::{ConversionError, Handler, HandlerResult, Messenger, PeerClosure, Position, SharedHandler};

/// Token prefix of host functions handed to the peer.
pub const HOST_CLOSURE_PREFIX: &str = "__hostClosures__.closure_$";

/// Token prefix of peer functions handed to the host.
pub const PEER_CLOSURE_PREFIX: &str = "__peerClosures__.closure_$";

/// Scope prefix of cancellation signals handed to the peer.
pub const ABORT_SCOPE_PREFIX: &str = "abortSignal_$";

// ---------------------------------------------------------------------------
// Byte arrays
// ---------------------------------------------------------------------------

/// Wraps bytes as a `byteArray` typed value (standard base64).
pub fn bytes_to_value(bytes: &[u8]) -> Value {
    TypedValue::new(TypedValueKind::ByteArray, Value::from(STANDARD.encode(bytes))).into_value()
}

/// Reads a `byteArray` typed value.
///
/// `null` (or a wrapper with a `null` body) decodes to `None`; anything
/// else must be a wrapper holding valid base64.
pub fn bytes_from_value(value: &Value, position: Position) -> Result<Option<Vec<u8>>, ConversionError> {
    if value.is_null() {
        return Ok(None);
    }
    let typed = expect_typed(value, TypedValueKind::ByteArray, position)?;
    match &typed.body {
        Value::Null => Ok(None),
        Value::String(text) => STANDARD
            .decode(text)
            .map(Some)
            .map_err(|source| ConversionError::Encoding { position, source }),
        other => Err(mismatch(position, "base64 string", other)),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Describes a JSON value's shape for error messages.
pub(crate) fn describe(value: &Value) -> String {
    if let Some(typed) = TypedValue::from_value(value) {
        return typed.kind.to_string();
    }
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_owned()
}

pub(crate) fn mismatch(position: Position, expected: &str, actual: &Value) -> ConversionError {
    ConversionError::TypeMismatch {
        position,
        expected: expected.to_owned(),
        actual: describe(actual),
    }
}

fn expect_typed(
    value: &Value,
    kind: TypedValueKind,
    position: Position,
) -> Result<TypedValue, ConversionError> {
    match TypedValue::from_value(value) {
        Some(typed) if typed.kind == kind => Ok(typed),
        _ => Err(mismatch(position, kind.as_str(), value)),
    }
}

/// Deserializes a plain JSON value into `T` without coercion.
pub(crate) fn convert<T: DeserializeOwned>(value: Value, position: Position) -> Result<T, ConversionError> {
    let actual = describe(&value);
    serde_json::from_value(value).map_err(|_| ConversionError::TypeMismatch {
        position,
        expected: short_type_name(std::any::type_name::<T>()),
        actual,
    })
}

// ---------------------------------------------------------------------------
// Args (peer → host)
// ---------------------------------------------------------------------------

/// `<scope>.cancel` handlers one inbound call registered for its abort
/// signals, released once its handler finishes.
pub(crate) type CancelScopes = Arc<Mutex<Vec<(String, SharedHandler)>>>;

/// The positional arguments of an inbound call.
///
/// A missing argument reads as `null`, so optional trailing parameters
/// work with `Option<T>`.
pub struct Args {
    values: Vec<Value>,
    messenger: Weak<Inner>,
    scopes: CancelScopes,
}

impl Args {
    pub(crate) fn new(values: Vec<Value>, messenger: Weak<Inner>, scopes: CancelScopes) -> Self {
        Self {
            values,
            messenger,
            scopes,
        }
    }

    /// Arguments not attached to any messenger. Closures decoded from them
    /// can't be called; abort signals still work locally.
    pub fn detached(values: Vec<Value>) -> Self {
        Self::new(values, Weak::new(), Arc::default())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The raw JSON of argument `index`.
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// The messenger this call arrived on, for handlers that call back
    /// into the peer.
    pub fn messenger(&self) -> Option<Messenger> {
        self.messenger.upgrade().map(Messenger::from_inner)
    }

    fn value(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or(Value::Null)
    }

    /// Converts argument `index` into `T`.
    ///
    /// # Errors
    /// [`ConversionError::TypeMismatch`] naming the argument index.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ConversionError> {
        convert(self.value(index), Position::Argument(index))
    }

    /// Decodes a `byteArray` argument. `null` decodes to `None`.
    pub fn bytes(&self, index: usize) -> Result<Option<Vec<u8>>, ConversionError> {
        bytes_from_value(&self.value(index), Position::Argument(index))
    }

    /// Decodes a `closure` argument into a callable [`PeerClosure`].
    pub fn closure(&self, index: usize) -> Result<PeerClosure, ConversionError> {
        let position = Position::Argument(index);
        let value = self.value(index);
        let typed = expect_typed(&value, TypedValueKind::Closure, position)?;
        match typed.body.as_str() {
            Some(token) if token.starts_with(PEER_CLOSURE_PREFIX) => {
                Ok(PeerClosure::new(token.to_owned(), self.messenger.clone()))
            }
            _ => Err(mismatch(position, "peer closure token", &typed.body)),
        }
    }

    /// Decodes an `abortSignal` argument into a cancellation token.
    ///
    /// A `null` argument yields a token that never fires. A signal that
    /// was already aborted yields a token that is already cancelled;
    /// otherwise a hidden `<scope>.cancel` method is registered so the
    /// peer can fire it later, and removed once this call's handler
    /// finishes.
    ///
    /// # Errors
    /// [`ConversionError::TypeMismatch`] if `<scope>.cancel` already names
    /// a registered method.
    pub fn abort_signal(&self, index: usize) -> Result<CancellationToken, ConversionError> {
        let position = Position::Argument(index);
        let value = self.value(index);
        let token = CancellationToken::new();
        if value.is_null() {
            return Ok(token);
        }

        let typed = expect_typed(&value, TypedValueKind::AbortSignal, position)?;
        let signal: AbortSignalBody = serde_json::from_value(typed.body.clone())
            .map_err(|_| mismatch(position, "abort signal body", &typed.body))?;

        if signal.aborted {
            token.cancel();
            return Ok(token);
        }

        let Some(inner) = self.messenger.upgrade() else {
            return Ok(token);
        };
        let trigger = token.clone();
        let cancel: SharedHandler = Arc::new(move |_: Args| {
            trigger.cancel();
            std::future::ready::<HandlerResult>(Ok(None))
        });
        let name = format!("{}.cancel", signal.scope);
        match inner
            .registry
            .register_new(&name, Arc::clone(&cancel), MethodMetadata::hidden())
        {
            Ok(name) => self
                .scopes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name, cancel)),
            Err(RegistryError::AlreadyRegistered(taken)) => {
                tracing::warn!(scope = %signal.scope, name = %taken, "abort scope collides with a registered method");
                return Err(ConversionError::TypeMismatch {
                    position,
                    expected: "unused abort scope".to_owned(),
                    actual: format!("scope '{}'", signal.scope),
                });
            }
            Err(e) => tracing::warn!(scope = %signal.scope, error = %e, "abort scope not registered"),
        }
        Ok(token)
    }
}

// ---------------------------------------------------------------------------
// Arg (host → peer)
// ---------------------------------------------------------------------------

/// One argument of a host-issued call.
pub enum Arg {
    /// Plain JSON.
    Value(Value),
    /// Sent as a `byteArray`.
    Bytes(Vec<u8>),
    /// A host function the peer may call back.
    Closure(SharedHandler),
    /// A cancellation signal mirrored to the peer.
    Abort(CancellationToken),
}

impl Arg {
    pub fn json(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(bytes.into())
    }

    pub fn closure(handler: impl Handler) -> Self {
        Self::Closure(Arc::new(handler))
    }

    pub fn abort(token: CancellationToken) -> Self {
        Self::Abort(token)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}
