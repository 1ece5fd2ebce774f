//! Tether frames over WebSocket (`tokio-tungstenite`).
//!
//! Each Tether frame is one WebSocket text message. Some embedded
//! browsers post binary messages; those are accepted when they decode as
//! UTF-8. Ping, pong and raw frames are skipped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::{Connection, ConnectionId, Transport, TransportError};

type Socket = WebSocketStream<TcpStream>;

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepts peers on a TCP port and upgrades them to WebSocket.
pub struct WebSocketTransport {
    listener: TcpListener,
    stopped: AtomicBool,
}

impl WebSocketTransport {
    /// Listens on `addr`. Port `0` picks a free port; see
    /// [`Self::local_addr`].
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Listen)?;
        tracing::info!(addr = ?listener.local_addr().ok(), "listening for peers");
        Ok(Self {
            listener,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::Listen)
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<WebSocketConnection, TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Closed("transport shut down".into()));
        }

        let (tcp, peer) = self.listener.accept().await.map_err(TransportError::Listen)?;
        let socket = tokio_tungstenite::accept_async(tcp)
            .await
            .map_err(|source| TransportError::Handshake { peer, source })?;

        Ok(WebSocketConnection::new(socket, peer))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.stopped.store(true, Ordering::Release);
        tracing::info!("no longer accepting peers");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One upgraded peer socket.
///
/// Reader and writer halves are locked separately; the pump sends while
/// a receive is parked.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: SocketAddr,
    writer: Mutex<SplitSink<Socket, Message>>,
    reader: Mutex<SplitStream<Socket>>,
}

impl WebSocketConnection {
    fn new(socket: Socket, peer: SocketAddr) -> Self {
        let id = ConnectionId::next();
        tracing::debug!(%id, %peer, "peer connected over websocket");
        let (writer, reader) = socket.split();
        Self {
            id,
            peer,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// What one WebSocket message means for the frame stream.
enum Incoming {
    Frame(String),
    Skip,
    End,
}

fn classify(message: Message) -> Result<Incoming, TransportError> {
    Ok(match message {
        Message::Text(text) => Incoming::Frame(text.as_str().to_owned()),
        Message::Binary(data) => Incoming::Frame(String::from_utf8(data.to_vec())?),
        Message::Close(_) => Incoming::End,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Incoming::Skip,
    })
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::text(text.to_owned())).await?;
        Ok(())
    }

    async fn recv_text(&self) -> Result<Option<String>, TransportError> {
        let mut reader = self.reader.lock().await;
        while let Some(message) = reader.next().await {
            match classify(message?)? {
                Incoming::Frame(text) => return Ok(Some(text)),
                Incoming::Skip => {}
                Incoming::End => break,
            }
        }
        Ok(None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer.lock().await.close().await?;
        tracing::debug!(id = %self.id, peer = %self.peer, "websocket closed");
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
