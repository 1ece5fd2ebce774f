//! Core protocol types for Tether's wire format.
//!
//! Every frame that crosses the boundary is a [`Message`] envelope encoded
//! as JSON text. The envelope carries a correlation id, a [`MessageKind`],
//! and an optional JSON body whose shape depends on the kind:
//!
//! | kind        | body                                   |
//! |-------------|----------------------------------------|
//! | `control`   | control-specific (or absent)           |
//! | `invoke`    | [`InvokeBody`]                         |
//! | `succeeded` | the result value (absent for void)     |
//! | `failed`    | [`ExceptionBody`]                      |
//!
//! Values that need special reconstruction on the receiving side
//! (functions, cancellation signals, byte buffers) travel inside a
//! [`TypedValue`] wrapper instead of as plain JSON.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Control ids
// ---------------------------------------------------------------------------

/// Well-known ids used by `control` messages.
///
/// Control messages are side-channel notifications rather than calls, so
/// their `id` names the notification instead of correlating a reply.
pub mod control {
    /// Peer → host: the peer runtime (re)started and is ready to talk.
    pub const READY: &str = "ready";
    /// Host → peer: expose a proxy function for a registered method.
    pub const INJECT: &str = "inject";
    /// Host → peer: remove a previously injected proxy.
    pub const DELETE: &str = "delete";
    /// Either direction: the sender dropped its last reference to a closure.
    pub const DISCARD: &str = "discard";
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The four message kinds of the protocol.
///
/// `#[serde(rename_all = "camelCase")]` makes these travel as `"control"`,
/// `"succeeded"`, `"failed"` and `"invoke"`, which is what the peer-side
/// bootstrap script expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Side-channel handshake or housekeeping (`ready`, `inject`, ...).
    Control,
    /// Successful reply to an `invoke`.
    Succeeded,
    /// Failed reply to an `invoke`.
    Failed,
    /// A method call.
    Invoke,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Invoke => write!(f, "invoke"),
        }
    }
}

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

/// The top-level envelope. Every frame on the wire is one `Message`.
///
/// ```text
/// {"id":"host_17","type":"invoke","body":{"name":"add","args":[1,2]}}
/// ```
///
/// The `id` of a reply is always the verbatim `id` of the `invoke` it
/// answers; nothing else ties the two together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation key (or control id for `control` messages).
    pub id: String,

    /// What kind of message this is. Travels as `"type"`.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Kind-specific payload. Omitted from the JSON when absent, and a JSON
    /// `null` body decodes to `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Message {
    /// Creates a control message.
    pub fn control(id: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Control,
            body,
        }
    }

    /// Creates a successful reply. A `null` result is sent without a body.
    pub fn succeeded(id: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Succeeded,
            body: body.filter(|value| !value.is_null()),
        }
    }

    /// Creates a failed reply carrying an [`ExceptionBody`].
    pub fn failed(
        id: impl Into<String>,
        error: &ExceptionBody,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: id.into(),
            kind: MessageKind::Failed,
            body: Some(serde_json::to_value(error).map_err(ProtocolError::Encode)?),
        })
    }

    /// Creates an invocation.
    pub fn invoke(
        id: impl Into<String>,
        body: &InvokeBody,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: id.into(),
            kind: MessageKind::Invoke,
            body: Some(serde_json::to_value(body).map_err(ProtocolError::Encode)?),
        })
    }

    /// Decodes the body into a concrete type.
    ///
    /// # Errors
    /// - [`ProtocolError::Malformed`] if the message has no body.
    /// - [`ProtocolError::Decode`] if the body has the wrong shape.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let body = self.body.clone().ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "{} message '{}' has no body",
                self.kind, self.id
            ))
        })?;
        serde_json::from_value(body).map_err(ProtocolError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Body of an `invoke` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeBody {
    /// Dotted method path, e.g. `"calc.add"`.
    pub name: String,

    /// Positional arguments. A missing `args` field means no arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl InvokeBody {
    /// Creates an invoke body.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Body of a `failed` message: the serialized form of an error raised by
/// the side that served the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionBody {
    /// The error's kind name (e.g. `"InvalidMethodName"`).
    pub name: String,

    /// Human-readable message.
    pub message: String,

    /// Optional diagnostic detail (stack or source chain). Empty unless the
    /// sender opted into verbose errors.
    #[serde(default)]
    pub detail: String,

    /// Extra fields the error type declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Map<String, Value>>,
}

impl ExceptionBody {
    /// Error name sent when an `invoke` names an unregistered method.
    pub const INVALID_METHOD_NAME: &'static str = "InvalidMethodName";

    /// Error name a peer uses to report that the call was cancelled.
    pub const OPERATION_CANCELLED: &'static str = "OperationCancelledError";

    /// Creates a body with an empty detail and no props.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            detail: String::new(),
            props: None,
        }
    }

    /// The standard reply for a call to an unknown method.
    pub fn invalid_method_name(method: &str) -> Self {
        Self::new(
            Self::INVALID_METHOD_NAME,
            format!("Method '{method}' is not found."),
        )
    }

    /// Sets the detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Sets the declared properties. An empty map is sent as no props.
    pub fn with_props(mut self, props: Map<String, Value>) -> Self {
        self.props = (!props.is_empty()).then_some(props);
        self
    }

    /// Returns `true` if this body reports a peer-side cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.name == Self::OPERATION_CANCELLED
    }
}

impl fmt::Display for ExceptionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// How strongly a deprecated method is flagged to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObsoleteLevel {
    /// Calls still work; the peer logs a warning.
    Obsolete,
    /// The peer proxy refuses to call it.
    Error,
}

/// Body of an `inject` control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectBody {
    /// Registered (normalized) method name.
    pub name: String,
    /// Deprecation level, or `null` if the method is current.
    pub obsolete: Option<ObsoleteLevel>,
    /// Message shown by the peer when a deprecated proxy is used.
    pub obsolete_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

/// The special value kinds that cross the boundary inside a [`TypedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypedValueKind {
    /// A callable function, addressed by a token.
    Closure,
    /// A cooperative cancellation signal.
    AbortSignal,
    /// A byte buffer, base64-encoded.
    ByteArray,
}

impl TypedValueKind {
    /// The wire spelling of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closure => "closure",
            Self::AbortSignal => "abortSignal",
            Self::ByteArray => "byteArray",
        }
    }
}

impl fmt::Display for TypedValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged wrapper: `{"__type__": <kind>, "__body__": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    /// Which special kind this is.
    #[serde(rename = "__type__")]
    pub kind: TypedValueKind,

    /// Kind-specific payload.
    #[serde(rename = "__body__", default)]
    pub body: Value,
}

impl TypedValue {
    /// The object key that marks a JSON object as a typed value.
    pub const TAG: &'static str = "__type__";

    /// Creates a typed value.
    pub fn new(kind: TypedValueKind, body: Value) -> Self {
        Self { kind, body }
    }

    /// Reads a typed value out of a JSON value.
    ///
    /// Returns `None` for anything that isn't an object carrying a
    /// recognised `__type__` tag; such values are plain JSON.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !object.contains_key(Self::TAG) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Converts into the JSON wrapper object.
    pub fn into_value(self) -> Value {
        let mut object = Map::with_capacity(2);
        object.insert(Self::TAG.into(), Value::from(self.kind.as_str()));
        object.insert("__body__".into(), self.body);
        Value::Object(object)
    }
}

/// Body of an `abortSignal` typed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortSignalBody {
    /// Scope id under which the signal's controller is addressed.
    #[serde(rename = "__scope__")]
    pub scope: String,

    /// `true` if the signal had already fired when it was sent.
    #[serde(rename = "__aborted__", default)]
    pub aborted: bool,
}

// =========================================================================
// Tests
// =========================================================================
