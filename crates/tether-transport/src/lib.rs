//! String-frame transports for Tether.
//!
//! A messenger never looks at sockets. It produces text frames and wants
//! to be handed the peer's text frames, nothing more, so that is all a
//! [`Connection`] offers. A [`Transport`] is where connections come from.
//!
//! | Type | Carries frames over |
//! |---|---|
//! | [`ChannelConnection`] | an in-process `mpsc` pair |
//! | [`WebSocketConnection`] | WebSocket text messages (`websocket` feature, on by default) |

#![allow(async_fn_in_trait)]

mod channel;
mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use channel::ChannelConnection;
pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// ConnectionId
// ---------------------------------------------------------------------------

/// Process-wide label for a connection, used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Hands out ids in increasing order, starting at 1.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A source of peer connections, such as a listening socket.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;
    type Error: std::error::Error + Send + Sync;

    /// Resolves with the next peer that connects.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Refuses further peers. Connections already accepted keep working.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A duplex pipe of UTF-8 text frames to one peer.
///
/// The messenger's pump polls `recv_text` inside a `tokio::select!` next
/// to outbound sends, so `recv_text` must be cancel-safe: a frame is
/// either returned or left for the next call, never dropped.
pub trait Connection: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Writes one frame.
    async fn send_text(&self, text: &str) -> Result<(), Self::Error>;

    /// Next frame from the peer, or `Ok(None)` once the peer has hung up.
    async fn recv_text(&self) -> Result<Option<String>, Self::Error>;

    /// Hangs up. The peer's next `recv_text` sees the end of the stream.
    async fn close(&self) -> Result<(), Self::Error>;

    fn id(&self) -> ConnectionId;
}
