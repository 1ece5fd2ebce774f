//! Wire protocol for Tether.
//!
//! This crate defines what the host and the peer runtime say to each
//! other:
//!
//! - **Types** ([`Message`], [`InvokeBody`], [`ExceptionBody`],
//!   [`TypedValue`], ...) are the structures that travel on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) converts them to and from
//!   text frames.
//! - **Errors** ([`ProtocolError`]) describe what can go wrong in between.
//!
//! The protocol layer knows nothing about pending calls, handlers or
//! connections.
//!
//! ```text
//! Transport (text) → Protocol (Message) → Messenger (calls, handlers)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    AbortSignalBody, ExceptionBody, InjectBody, InvokeBody, Message,
    MessageKind, ObsoleteLevel, TypedValue, TypedValueKind, control,
};
