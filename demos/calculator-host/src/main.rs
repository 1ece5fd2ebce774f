use std::time::Duration;

use tether::prelude::*;
use tether::{DeprecationLevel, MessengerIo, SharedHandler};
use tether_transport::{Connection, Transport, WebSocketConnection, WebSocketTransport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ---------------------------------------------------------------------------
// Calculator methods
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("division by zero")]
struct DivideByZero;

async fn add(args: Args) -> HandlerResult {
    let a: f64 = args.get(0)?;
    let b: f64 = args.get(1)?;
    reply(a + b)
}

async fn divide(args: Args) -> HandlerResult {
    let a: f64 = args.get(0)?;
    let b: f64 = args.get(1)?;
    if b == 0.0 {
        return Err(HandlerError::from(DivideByZero).with_prop("dividend", a));
    }
    reply(a / b)
}

async fn sum(args: Args) -> HandlerResult {
    let values: Vec<f64> = args.get(0)?;
    reply(values.iter().sum::<f64>())
}

async fn checksum(args: Args) -> HandlerResult {
    let bytes = args.bytes(0)?.unwrap_or_default();
    reply(bytes.iter().fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b))))
}

/// Calls the peer's `onTick(n)` once per step until zero, unless the
/// peer aborts first.
async fn countdown(args: Args) -> HandlerResult {
    let from: u32 = args.get(0)?;
    let on_tick = args.closure(1)?.with_arity(1)?;
    let abort = args.abort_signal(2)?;

    for n in (1..=from).rev() {
        tokio::select! {
            () = abort.cancelled() => {
                return Err(HandlerError::new("OperationCancelledError", "countdown aborted"));
            }
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        on_tick.call(vec![Arg::json(n)]).await?;
    }
    reply("liftoff")
}

fn calculator() -> HandlerSet<SharedHandler> {
    HandlerSet::new()
        .method("Add", handler(add))
        .method("Divide", handler(divide))
        .method("Sum", handler(sum))
        .method_with(
            "Plus",
            handler(sum),
            MethodMetadata::default().deprecated(DeprecationLevel::Warning, Some("use calc.sum")),
        )
        .method("Checksum", handler(checksum))
        .method("Countdown", handler(countdown))
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

async fn handle_connection(conn: WebSocketConnection, config: MessengerConfig) {
    let conn_id = conn.id();
    let (messenger, io) = Messenger::new(config);
    let MessengerIo { outbound, mut events } = io;

    if let Err(e) = messenger.register_object(Some("calc"), &calculator()) {
        tracing::error!(%conn_id, error = %e, "calculator not registered");
        return;
    }

    let watcher = messenger.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = watcher.closed() => break,
                event = events.recv() => match event {
                    Some(MessengerEvent::Ready) => {
                        tracing::info!(%conn_id, "peer ready");
                        greet(&watcher).await;
                    }
                    Some(MessengerEvent::Malformed { reason, .. }) => {
                        tracing::warn!(%conn_id, %reason, "peer sent a malformed frame");
                    }
                    Some(MessengerEvent::Spurious { id, kind }) => {
                        tracing::debug!(%conn_id, %id, %kind, "late reply");
                    }
                    None => break,
                },
            }
        }
    });

    if let Err(e) = serve(conn, messenger.clone(), outbound).await {
        tracing::warn!(%conn_id, error = %e, "connection ended with an error");
    }
    messenger.shutdown();
}

/// Asks the peer who it is; peers without a `hello` method are fine.
async fn greet(messenger: &Messenger) {
    match messenger
        .invoke_peer_as::<String>("hello", vec![Arg::json("calculator-host")])
        .await
    {
        Ok(answer) => tracing::info!(%answer, "peer greeted us"),
        Err(e) => tracing::debug!(error = %e, "peer did not answer hello"),
    }
}

async fn run(mut transport: WebSocketTransport, config: MessengerConfig) {
    loop {
        match transport.accept().await {
            Ok(conn) => {
                tokio::spawn(handle_connection(conn, config.clone()));
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tether=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_owned());
    let config = if std::env::var_os("TETHER_DEBUG").is_some() {
        MessengerConfig::debugging()
    } else {
        MessengerConfig::default()
    };

    let transport = WebSocketTransport::bind(&addr).await?;
    tracing::info!(addr = %transport.local_addr()?, "calculator host listening");
    run(transport, config).await;
    Ok(())
}
