//! # Tether
//!
//! Full-duplex RPC between a host process and a sandboxed peer (a script
//! runtime, a web view, a worker) that can only exchange text messages.
//!
//! Either side can call methods the other side registered. Calls are
//! correlated by id, time out if the peer never answers, and can carry
//! three special kinds of value: functions, cancellation signals and byte
//! buffers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::{Args, Messenger, MessengerConfig, reply};
//! use tether_transport::ChannelConnection;
//!
//! # async fn run() -> Result<(), tether::TetherError> {
//! let (messenger, io) = Messenger::new(MessengerConfig::default());
//! messenger.register("add", |args: Args| async move {
//!     let a: i64 = args.get(0)?;
//!     let b: i64 = args.get(1)?;
//!     reply(a + b)
//! })?;
//!
//! let (host_end, _peer_end) = ChannelConnection::pair();
//! tether::serve(host_end, messenger, io.outbound).await
//! # }
//! ```
//!
//! ## Crate map
//!
//! - [`tether_protocol`]: wire envelope and codec
//! - [`tether_registry`]: name → handler map, scoped objects
//! - [`tether_pending`]: pending-call table and timeout sweeper
//! - [`tether_transport`]: text connections (in-memory, WebSocket)

mod closure;
mod config;
mod error;
mod handler;
mod marshal;
mod messenger;
mod serve;

pub use closure::PeerClosure;
pub use config::MessengerConfig;
pub use error::{ConversionError, Position, TetherError};
pub use handler::{Handler, HandlerError, HandlerResult, SharedHandler, handler, reply};
pub use marshal::{
    ABORT_SCOPE_PREFIX, Arg, Args, HOST_CLOSURE_PREFIX, PEER_CLOSURE_PREFIX, bytes_from_value,
    bytes_to_value,
};
pub use messenger::{
    HANDLER_PANICKED, INVALID_INVOCATION, Messenger, MessengerEvent, MessengerIo,
};
pub use serve::serve;

pub use tether_pending::{CallError, CancelReason};
pub use tether_protocol::{ExceptionBody, MessageKind};
pub use tether_registry::{
    Deprecation, DeprecationLevel, HandlerSet, MethodMetadata, MethodSource, NamingConvention,
};
pub use tokio_util::sync::CancellationToken;

/// Everything an embedder usually needs.
pub mod prelude {
    pub use crate::{
        Arg, Args, CancellationToken, HandlerError, HandlerResult, HandlerSet, Messenger,
        MessengerConfig, MessengerEvent, MethodMetadata, PeerClosure, TetherError, handler,
        reply, serve,
    };
}
