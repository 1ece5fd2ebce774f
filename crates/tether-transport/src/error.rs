use std::string::FromUtf8Error;

/// Why a connection or listener stopped working.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// One end hung up; the message says which.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The listening socket could not be bound or stopped accepting.
    #[error("listener failed: {0}")]
    Listen(#[source] std::io::Error),

    /// A TCP client connected but never completed the WebSocket upgrade.
    #[cfg(feature = "websocket")]
    #[error("websocket handshake with {peer} failed: {source}")]
    Handshake {
        peer: std::net::SocketAddr,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The WebSocket broke while sending or receiving.
    #[cfg(feature = "websocket")]
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A binary frame arrived that doesn't hold UTF-8 text.
    #[error("frame is not UTF-8 text: {0}")]
    NotText(#[from] FromUtf8Error),
}
