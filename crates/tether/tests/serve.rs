//! `serve` over an in-memory connection.

use std::time::Duration;

use serde_json::{Value, json};
use tether::prelude::*;
use tether::{CallError, CancelReason};
use tether_transport::{ChannelConnection, Connection};

async fn add(args: Args) -> HandlerResult {
    let a: i64 = args.get(0)?;
    let b: i64 = args.get(1)?;
    reply(a + b)
}

async fn recv_json(peer: &ChannelConnection) -> Option<Value> {
    let text = tokio::time::timeout(Duration::from_secs(5), peer.recv_text())
        .await
        .expect("no frame within timeout")
        .unwrap()?;
    Some(serde_json::from_str(&text).unwrap())
}

#[tokio::test]
async fn test_serve_round_trip() {
    let (messenger, io) = Messenger::new(MessengerConfig::default());
    messenger.register("add", add).unwrap();
    let (host_end, peer) = ChannelConnection::pair();
    let server = tokio::spawn(serve(host_end, messenger.clone(), io.outbound));

    assert_eq!(recv_json(&peer).await.unwrap()["id"], "inject");
    peer.send_text(r#"{"id":"1","type":"invoke","body":{"name":"add","args":[1,2]}}"#)
        .await
        .unwrap();
    assert_eq!(recv_json(&peer).await.unwrap(), json!({"id":"1","type":"succeeded","body":3}));

    messenger.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_serve_peer_calls_resolve() {
    let (messenger, io) = Messenger::new(MessengerConfig::default());
    let (host_end, peer) = ChannelConnection::pair();
    let _server = tokio::spawn(serve(host_end, messenger.clone(), io.outbound));

    let caller = messenger.clone();
    let call = tokio::spawn(async move { caller.invoke_peer_as::<String>("name", vec![]).await });
    let frame = recv_json(&peer).await.unwrap();
    peer.send_text(&json!({"id": frame["id"], "type":"succeeded", "body":"peer"}).to_string())
        .await
        .unwrap();

    assert_eq!(call.await.unwrap().unwrap(), "peer");
}

#[tokio::test]
async fn test_serve_peer_disconnect_cancels_pending() {
    let (messenger, io) = Messenger::new(MessengerConfig::default());
    let (host_end, peer) = ChannelConnection::pair();
    let server = tokio::spawn(serve(host_end, messenger.clone(), io.outbound));

    let caller = messenger.clone();
    let call = tokio::spawn(async move { caller.invoke_peer("slow", vec![]).await });
    let _frame = recv_json(&peer).await.unwrap();
    drop(peer);

    server.await.unwrap().unwrap();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::Call(CallError::Cancelled(CancelReason::PeerReset))));
    assert!(!messenger.is_closed());
}

#[tokio::test]
async fn test_serve_shutdown_closes_connection() {
    let (messenger, io) = Messenger::new(MessengerConfig::default());
    let (host_end, peer) = ChannelConnection::pair();
    let server = tokio::spawn(serve(host_end, messenger.clone(), io.outbound));

    messenger.shutdown();

    server.await.unwrap().unwrap();
    assert_eq!(recv_json(&peer).await, None);
}

#[tokio::test]
async fn test_serve_survives_malformed_frames() {
    let (messenger, mut io) = Messenger::new(MessengerConfig::default());
    messenger.register_with("add", add, MethodMetadata::hidden()).unwrap();
    let (host_end, peer) = ChannelConnection::pair();
    let _server = tokio::spawn(serve(host_end, messenger.clone(), io.outbound));

    peer.send_text("garbage").await.unwrap();
    peer.send_text(r#"{"id":"2","type":"invoke","body":{"name":"add","args":[2,3]}}"#)
        .await
        .unwrap();

    assert_eq!(recv_json(&peer).await.unwrap()["body"], 5);
    assert!(matches!(io.events.recv().await, Some(MessengerEvent::Malformed { .. })));
}
