//! Codec trait and the JSON text codec.
//!
//! Frames cross the boundary as text, so a Tether codec converts between
//! Rust values and `String`s. The messenger only ever talks to the
//! [`Codec`] trait; [`JsonCodec`] is the implementation the peer-side
//! bootstrap script understands.

use serde::{Serialize, de::DeserializeOwned};

use crate::{Message, ProtocolError};

/// A codec that turns values into text frames and back.
///
/// `Send + Sync + 'static` because a codec lives inside the messenger,
/// which is shared across Tokio tasks.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into a text frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if the value can't be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError>;

    /// Parses a text frame into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the text is not valid or has
    /// the wrong shape.
    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, ProtocolError>;

    /// Encodes a [`Message`] envelope.
    fn encode_message(&self, message: &Message) -> Result<String, ProtocolError> {
        self.encode(message)
    }

    /// Decodes a [`Message`] envelope and checks the envelope rules that
    /// serde can't express.
    ///
    /// # Errors
    /// - [`ProtocolError::Decode`] for invalid JSON or a missing field.
    /// - [`ProtocolError::Malformed`] for an empty correlation id.
    fn decode_message(&self, text: &str) -> Result<Message, ProtocolError> {
        let message: Message = self.decode(text)?;
        if message.id.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{} message with an empty id",
                message.kind
            )));
        }
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`.
///
/// ## Example
///
/// ```rust
/// use tether_protocol::{Codec, InvokeBody, JsonCodec, Message};
///
/// let codec = JsonCodec;
/// let message = Message::invoke("host_1", &InvokeBody::new("ping", vec![])).unwrap();
///
/// let text = codec.encode_message(&message).unwrap();
/// let decoded = codec.decode_message(&text).unwrap();
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError> {
        serde_json::to_string(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{ExceptionBody, MessageKind};

    #[test]
    fn test_decode_message_failed_reply() {
        let text = r#"{"id":"host_4","type":"failed","body":{"name":"RangeError","message":"too big","detail":"at f (x.js:1)"}}"#;
        let message = JsonCodec.decode_message(text).unwrap();

        assert_eq!(message.kind, MessageKind::Failed);
        let body: ExceptionBody = message.body_as().unwrap();
        assert_eq!(body.name, "RangeError");
        assert_eq!(body.detail, "at f (x.js:1)");
    }

    #[test]
    fn test_decode_message_invalid_json_fails() {
        let result = JsonCodec.decode_message("{not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_message_missing_id_fails() {
        let result = JsonCodec.decode_message(r#"{"type":"succeeded"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_message_empty_id_is_malformed() {
        let result = JsonCodec.decode_message(r#"{"id":"","type":"succeeded"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_message_ignores_unknown_fields() {
        let text = r#"{"id":"1","type":"succeeded","body":3,"trace":"x"}"#;
        let message = JsonCodec.decode_message(text).unwrap();
        assert_eq!(message.body, Some(json!(3)));
    }

    #[test]
    fn test_encode_message_control_with_string_body() {
        let message = Message::control("delete", Some(json!("calc.add")));
        let text = JsonCodec.encode_message(&message).unwrap();
        assert_eq!(text, r#"{"id":"delete","type":"control","body":"calc.add"}"#);
    }
}
