//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding frames.
///
/// A `ProtocolError` always means the problem is in the text itself (bad
/// JSON, wrong shape, broken envelope), never in the connection or in a
/// method handler.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: invalid JSON, a missing required field, or
    /// a value of the wrong type.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame parsed but breaks an envelope rule, e.g. an empty id or a
    /// missing body where one is required.
    #[error("malformed message: {0}")]
    Malformed(String),
}
