//! The handler model: what a registered method is, and how its failures
//! reach the peer.
//!
//! A handler takes the call's [`Args`] and asynchronously produces either
//! a JSON result or a [`HandlerError`]. Any `async` closure with the right
//! shape is a handler:
//!
//! ```rust
//! use tether::{Args, HandlerResult, reply};
//!
//! let add = |args: Args| async move {
//!     let a: i64 = args.get(0)?;
//!     let b: i64 = args.get(1)?;
//!     reply(a + b)
//! };
//! # let _ = add;
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tether_protocol::ExceptionBody;

use crate::Args;

/// What a handler produces: a result value (`None` for void) or an error.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// A handler shared between the registry and in-flight invocations.
pub type SharedHandler = Arc<dyn Handler>;

/// A callable registered method (or host closure).
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: Args) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Args) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(args))
    }
}

/// Wraps a handler for use in a [`HandlerSet`](tether_registry::HandlerSet).
pub fn handler(h: impl Handler) -> SharedHandler {
    Arc::new(h)
}

/// Serializes a return value into a handler result.
///
/// `()` and `None` serialize to `null`, which is sent as a void reply.
pub fn reply<T: Serialize>(value: T) -> HandlerResult {
    let value = serde_json::to_value(value)?;
    Ok((!value.is_null()).then_some(value))
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// An error raised by a handler, in the shape the peer receives it.
///
/// Any `std::error::Error` converts into a `HandlerError` with `?`. The
/// error's type name becomes `name`, its `Display` text becomes
/// `message`, and its source chain becomes `detail` (only sent when the
/// messenger has verbose errors on).
#[derive(Debug, Clone)]
pub struct HandlerError {
    name: String,
    message: String,
    detail: String,
    props: Map<String, Value>,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            detail: String::new(),
            props: Map::new(),
        }
    }

    /// Adds one declared property.
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Adds every field of a serializable struct as a property.
    ///
    /// Values that don't serialize to a JSON object are ignored.
    pub fn with_props<T: Serialize>(mut self, props: &T) -> Self {
        if let Ok(Value::Object(fields)) = serde_json::to_value(props) {
            self.props.extend(fields);
        }
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Converts into the wire body. `detail` is dropped unless `verbose`.
    pub fn into_exception(self, verbose: bool) -> ExceptionBody {
        let body = ExceptionBody::new(self.name, self.message).with_props(self.props);
        if verbose {
            body.with_detail(self.detail)
        } else {
            body
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + 'static,
{
    fn from(error: E) -> Self {
        let mut detail = format!("{error:?}");
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push_str("\ncaused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            name: kind_name::<E>(),
            message: error.to_string(),
            detail,
            props: Map::new(),
        }
    }
}

/// Short type name of an error type (`ParseIntError` rather than
/// `core::num::error::ParseIntError`), computed once per type.
fn kind_name<E: 'static>() -> String {
    static NAMES: OnceLock<Mutex<HashMap<TypeId, String>>> = OnceLock::new();

    let names = NAMES.get_or_init(|| Mutex::new(HashMap::new()));
    names
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(TypeId::of::<E>())
        .or_insert_with(|| short_type_name(std::any::type_name::<E>()))
        .clone()
}

pub(crate) fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}
