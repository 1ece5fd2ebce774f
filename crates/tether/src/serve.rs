//! Connection pump: moves frames between a [`Connection`] and a
//! [`Messenger`].

use tether_pending::CancelReason;
use tether_transport::{Connection, TransportError};
use tokio::sync::mpsc;

use crate::{Messenger, TetherError};

/// Drives one connection until either side closes.
///
/// Inbound frames go to [`Messenger::received_request`]; frames from
/// `outbound` (the messenger's [`MessengerIo::outbound`](crate::MessengerIo))
/// are written to the connection in order. Returns `Ok(())` when the peer
/// disconnects or the messenger shuts down.
///
/// When the peer goes away, calls still waiting on it are cancelled.
pub async fn serve<C>(
    conn: C,
    messenger: Messenger,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> Result<(), TetherError>
where
    C: Connection<Error = TransportError>,
{
    let conn_id = conn.id();
    tracing::info!(%conn_id, "serving connection");

    let result = loop {
        tokio::select! {
            frame = conn.recv_text() => match frame {
                Ok(Some(text)) => messenger.received_request(&text),
                Ok(None) => {
                    tracing::info!(%conn_id, "peer closed the connection");
                    break Ok(());
                }
                Err(e) => {
                    tracing::debug!(%conn_id, error = %e, "receive failed");
                    break Err(e.into());
                }
            },
            text = outbound.recv() => match text {
                Some(text) => {
                    if let Err(e) = conn.send_text(&text).await {
                        tracing::debug!(%conn_id, error = %e, "send failed");
                        break Err(e.into());
                    }
                }
                None => break Ok(()),
            },
            () = messenger.closed() => {
                // Flush whatever was queued before the shutdown.
                while let Ok(text) = outbound.try_recv() {
                    if conn.send_text(&text).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = conn.close().await {
                    tracing::debug!(%conn_id, error = %e, "close failed");
                }
                tracing::info!(%conn_id, "messenger shut down, connection closed");
                break Ok(());
            }
        }
    };

    if !messenger.is_closed() {
        let cancelled = messenger.cancel_all_pending_with(CancelReason::PeerReset);
        if cancelled > 0 {
            tracing::debug!(%conn_id, cancelled, "calls cancelled on disconnect");
        }
    }
    result
}
