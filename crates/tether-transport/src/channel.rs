//! In-memory connection pair.
//!
//! Two [`ChannelConnection`]s wired back to back: whatever one sends, the
//! other receives. Used by tests and by embedders whose peer lives in the
//! same process and already exposes a string-passing callback.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::{Connection, ConnectionId, TransportError};

/// One end of an in-memory text channel.
pub struct ChannelConnection {
    id: ConnectionId,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ChannelConnection {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            id: ConnectionId::next(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl Connection for ChannelConnection {
    type Error = TransportError;

    async fn send_text(&self, text: &str) -> Result<(), Self::Error> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return Err(TransportError::Closed("closed locally".into()));
        };
        tx.send(text.to_owned())
            .map_err(|_| TransportError::Closed("peer end dropped".into()))
    }

    async fn recv_text(&self) -> Result<Option<String>, Self::Error> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        // Dropping our sender ends the other side's receive loop.
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.rx.lock().await.close();
        tracing::debug!(id = %self.id, "channel connection closed");
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
