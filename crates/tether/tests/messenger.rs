//! Dispatcher and host-issued call behaviour, driven frame by frame.

mod common;

use std::time::Duration;

use common::Harness;
use serde_json::json;
use tether::prelude::*;
use tether::{CallError, CancelReason, DeprecationLevel, MessageKind};
use tokio::time::Instant;

async fn add(args: Args) -> HandlerResult {
    let a: i64 = args.get(0)?;
    let b: i64 = args.get(1)?;
    reply(a + b)
}

#[derive(Debug, thiserror::Error)]
#[error("balance too low")]
struct InsufficientFunds;

async fn withdraw(_: Args) -> HandlerResult {
    Err(HandlerError::from(InsufficientFunds).with_prop("balance", 5))
}

async fn boom(_: Args) -> HandlerResult {
    panic!("kaboom")
}

// =========================================================================
// Serving invocations
// =========================================================================

#[tokio::test]
async fn test_invoke_add_replies_with_sum() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger.register("add", add).unwrap();
    let _inject = h.next_frame().await;

    h.peer_sends(json!({"id":"1","type":"invoke","body":{"name":"add","args":[1,2]}}));

    assert_eq!(h.next_text().await, r#"{"id":"1","type":"succeeded","body":3}"#);
}

#[tokio::test]
async fn test_register_announces_proxy() {
    let mut h = Harness::new(MessengerConfig::default());

    let name = h.messenger.register("Calc.Add", add).unwrap();

    assert_eq!(name, "calc.add");
    assert_eq!(
        h.next_frame().await,
        json!({"id":"inject","type":"control","body":{"name":"calc.add","obsolete":null,"obsoleteMessage":null}})
    );
}

#[tokio::test]
async fn test_register_deprecated_method_carries_obsolete_message() {
    let mut h = Harness::new(MessengerConfig::default());
    let metadata = MethodMetadata::default().deprecated(DeprecationLevel::Error, Some("use sum"));

    h.messenger.register_with("old", add, metadata).unwrap();

    let frame = h.next_frame().await;
    assert_eq!(frame["body"]["obsolete"], "error");
    assert_eq!(frame["body"]["obsoleteMessage"], "old is obsoleted: use sum");
}

#[tokio::test]
async fn test_register_hidden_method_sends_nothing() {
    let mut h = Harness::new(MessengerConfig::default());

    h.messenger
        .register_with("internal", add, MethodMetadata::hidden())
        .unwrap();

    assert!(h.queued_frames().is_empty());
    assert_eq!(h.messenger.registered_methods(), vec!["internal"]);
}

#[tokio::test]
async fn test_unregister_sends_delete() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger.register("add", add).unwrap();
    let _inject = h.next_frame().await;

    assert!(h.messenger.unregister("add"));
    assert!(!h.messenger.unregister("add"));

    assert_eq!(h.next_frame().await, json!({"id":"delete","type":"control","body":"add"}));
}

#[tokio::test]
async fn test_invoke_unknown_method_fails_and_leaves_registry() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger.register("add", add).unwrap();
    let before = h.messenger.registered_methods();

    h.peer_sends(json!({"id":"9","type":"invoke","body":{"name":"js_missing","args":[]}}));

    let reply = h.next_call_frame().await;
    assert_eq!(reply["id"], "9");
    assert_eq!(reply["type"], "failed");
    assert_eq!(reply["body"]["name"], "InvalidMethodName");
    assert_eq!(reply["body"]["message"], "Method 'js_missing' is not found.");
    assert_eq!(h.messenger.registered_methods(), before);
}

#[tokio::test]
async fn test_invoke_void_handler_replies_without_body() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger
        .register_with("noop", |_: Args| async { reply(()) }, MethodMetadata::hidden())
        .unwrap();

    h.peer_sends(json!({"id":"v","type":"invoke","body":{"name":"noop"}}));

    assert_eq!(h.next_text().await, r#"{"id":"v","type":"succeeded"}"#);
}

#[tokio::test]
async fn test_invoke_bad_argument_fails_with_conversion_error() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger
        .register_with("add", add, MethodMetadata::hidden())
        .unwrap();

    h.peer_sends(json!({"id":"2","type":"invoke","body":{"name":"add","args":[1,"2"]}}));

    let reply = h.next_frame().await;
    assert_eq!(reply["type"], "failed");
    assert_eq!(reply["body"]["name"], "ConversionError");
    assert_eq!(reply["body"]["message"], "argument 1: expected i64, got string");
}

#[tokio::test]
async fn test_invoke_without_body_fails() {
    let mut h = Harness::new(MessengerConfig::default());

    h.peer_sends(json!({"id":"3","type":"invoke"}));

    let reply = h.next_frame().await;
    assert_eq!(reply["id"], "3");
    assert_eq!(reply["body"]["name"], tether::INVALID_INVOCATION);
}

#[tokio::test]
async fn test_handler_error_serializes_props_without_detail() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger
        .register_with(
            "withdraw",
            withdraw,
            MethodMetadata::hidden(),
        )
        .unwrap();

    h.peer_sends(json!({"id":"w","type":"invoke","body":{"name":"withdraw","args":[10]}}));

    let reply = h.next_frame().await;
    assert_eq!(
        reply,
        json!({
            "id": "w",
            "type": "failed",
            "body": {
                "name": "InsufficientFunds",
                "message": "balance too low",
                "detail": "",
                "props": {"balance": 5}
            }
        })
    );
}

#[tokio::test]
async fn test_handler_error_verbose_includes_detail() {
    let mut h = Harness::new(MessengerConfig {
        verbose_errors: true,
        ..MessengerConfig::default()
    });
    h.messenger
        .register_with(
            "withdraw",
            withdraw,
            MethodMetadata::hidden(),
        )
        .unwrap();

    h.peer_sends(json!({"id":"w","type":"invoke","body":{"name":"withdraw"}}));

    let reply = h.next_frame().await;
    assert!(!reply["body"]["detail"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_handler_panic_replies_failed() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger
        .register_with(
            "boom",
            boom,
            MethodMetadata::hidden(),
        )
        .unwrap();

    h.peer_sends(json!({"id":"p","type":"invoke","body":{"name":"boom"}}));

    let reply = h.next_frame().await;
    assert_eq!(reply["id"], "p");
    assert_eq!(reply["body"]["name"], tether::HANDLER_PANICKED);
    assert_eq!(reply["body"]["message"], "kaboom");
}

#[tokio::test]
async fn test_slow_handler_does_not_block_dispatch() {
    let mut h = Harness::new(MessengerConfig::default());
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = std::sync::Mutex::new(Some(release_rx));
    h.messenger
        .register_with(
            "slow",
            move |_: Args| {
                let rx = release_rx.lock().unwrap().take();
                async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    reply("slow")
                }
            },
            MethodMetadata::hidden(),
        )
        .unwrap();
    h.messenger
        .register_with("add", add, MethodMetadata::hidden())
        .unwrap();

    h.peer_sends(json!({"id":"s","type":"invoke","body":{"name":"slow"}}));
    h.peer_sends(json!({"id":"f","type":"invoke","body":{"name":"add","args":[2,2]}}));

    assert_eq!(h.next_frame().await["id"], "f");
    release_tx.send(()).unwrap();
    assert_eq!(h.next_frame().await, json!({"id":"s","type":"succeeded","body":"slow"}));
}

#[tokio::test]
async fn test_register_object_scopes_methods() {
    let mut h = Harness::new(MessengerConfig::default());
    let calc = HandlerSet::new()
        .method("Add", handler(add))
        .method("add", handler(|_: Args| async { reply("shadowed") }));

    let names = h.messenger.register_object(Some("calc"), &calc).unwrap();
    assert_eq!(names, vec!["calc.add"]);
    let _inject = h.next_frame().await;

    h.peer_sends(json!({"id":"o","type":"invoke","body":{"name":"calc.add","args":[4,5]}}));
    assert_eq!(h.next_frame().await["body"], 9);

    let removed = h.messenger.unregister_object(Some("calc"), &calc).unwrap();
    assert_eq!(removed, vec!["calc.add"]);
    assert_eq!(h.next_frame().await["id"], "delete");
}

// =========================================================================
// Replies from the peer
// =========================================================================

#[tokio::test]
async fn test_spurious_reply_is_reported() {
    let mut h = Harness::new(MessengerConfig::default());

    h.peer_sends(json!({"id":"host_99","type":"succeeded","body":1}));

    assert_eq!(
        h.next_event().await,
        MessengerEvent::Spurious {
            id: "host_99".into(),
            kind: MessageKind::Succeeded
        }
    );
}

#[tokio::test]
async fn test_spurious_failure_is_reported() {
    let mut h = Harness::new(MessengerConfig::default());

    h.peer_sends(json!({"id":"host_42","type":"failed","body":{"name":"Error","message":"late"}}));

    assert_eq!(
        h.next_event().await,
        MessengerEvent::Spurious {
            id: "host_42".into(),
            kind: MessageKind::Failed
        }
    );
    assert!(h.queued_frames().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_is_reported_and_dropped() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger
        .register_with("add", add, MethodMetadata::hidden())
        .unwrap();

    h.messenger.received_request("{not json");
    h.messenger.received_request(r#"{"id":"1"}"#);

    assert!(matches!(h.next_event().await, MessengerEvent::Malformed { .. }));
    assert!(matches!(h.next_event().await, MessengerEvent::Malformed { frame, .. } if frame == r#"{"id":"1"}"#));

    h.peer_sends(json!({"id":"ok","type":"invoke","body":{"name":"add","args":[1,1]}}));
    assert_eq!(h.next_frame().await["body"], 2);
}

#[tokio::test]
async fn test_invoke_peer_resolves_out_of_order() {
    let mut h = Harness::new(MessengerConfig::default());

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let messenger = h.messenger.clone();
            tokio::spawn(async move { messenger.invoke_peer("echo", vec![Arg::json(i)]).await })
        })
        .collect();

    let mut frames = Vec::new();
    for _ in 0..3 {
        frames.push(h.next_frame().await);
    }
    for frame in frames.iter().rev() {
        let arg = frame["body"]["args"][0].clone();
        h.peer_sends(json!({"id": frame["id"], "type": "succeeded", "body": arg}));
    }

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result, Some(json!(i)));
    }
    assert_eq!(h.messenger.pending_calls(), 0);
}

#[tokio::test]
async fn test_invoke_peer_frame_format() {
    let mut h = Harness::new(MessengerConfig::default());
    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move {
        messenger
            .invoke_peer_as::<String>("greet", vec![Arg::json("bob")])
            .await
    });

    assert_eq!(
        h.next_frame().await,
        json!({"id":"host_1","type":"invoke","body":{"name":"greet","args":["bob"]}})
    );
    h.peer_sends(json!({"id":"host_1","type":"succeeded","body":"hi bob"}));

    assert_eq!(call.await.unwrap().unwrap(), "hi bob");
}

#[tokio::test]
async fn test_invoke_peer_as_wrong_result_type_fails() {
    let mut h = Harness::new(MessengerConfig::default());
    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move { messenger.invoke_peer_as::<i64>("count", vec![]).await });

    let frame = h.next_frame().await;
    h.peer_sends(json!({"id": frame["id"], "type":"succeeded", "body":"many"}));

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        TetherError::Conversion(tether::ConversionError::TypeMismatch {
            position: tether::Position::Result,
            ..
        })
    ));
}

#[tokio::test]
async fn test_peer_failure_carries_exception() {
    let mut h = Harness::new(MessengerConfig::default());
    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move { messenger.invoke_peer("parse", vec![]).await });

    let frame = h.next_frame().await;
    h.peer_sends(json!({
        "id": frame["id"],
        "type": "failed",
        "body": {"name":"SyntaxError","message":"bad input","detail":"at parse (x.js:3)","props":{"line":3}}
    }));

    let err = call.await.unwrap().unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(exception.name, "SyntaxError");
    assert_eq!(exception.detail, "at parse (x.js:3)");
    assert_eq!(exception.props.as_ref().unwrap()["line"], 3);
}

#[tokio::test]
async fn test_peer_cancellation_failure_is_cancelled() {
    let mut h = Harness::new(MessengerConfig::default());
    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move { messenger.invoke_peer("wait", vec![]).await });

    let frame = h.next_frame().await;
    h.peer_sends(json!({
        "id": frame["id"],
        "type": "failed",
        "body": {"name":"OperationCancelledError","message":"aborted"}
    }));

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(matches!(err, TetherError::Call(CallError::Cancelled(CancelReason::Peer))));
}

// =========================================================================
// Timeouts and cancellation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_invoke_missing_peer_method_times_out() {
    let mut h = Harness::new(MessengerConfig::with_timeout(Duration::from_secs(5)));
    let messenger = h.messenger.clone();
    let start = Instant::now();
    let call = tokio::spawn(async move { messenger.invoke_peer("js_missing", vec![]).await });

    let frame = h.next_frame().await;
    let id = frame["id"].as_str().unwrap().to_owned();
    let err = call.await.unwrap().unwrap_err();

    assert!(err.is_cancelled());
    assert!(matches!(err, TetherError::Call(CallError::Cancelled(CancelReason::TimedOut))));
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(!h.messenger.is_pending(&id));
}

#[tokio::test(start_paused = true)]
async fn test_invoke_short_timeout_fires_within_margin() {
    let mut h = Harness::new(MessengerConfig::with_timeout(Duration::from_millis(50)));
    let messenger = h.messenger.clone();
    let start = Instant::now();
    let call = tokio::spawn(async move { messenger.invoke_peer("silent", vec![]).await });

    let _frame = h.next_frame().await;
    let err = call.await.unwrap().unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_cancelled());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed <= Duration::from_millis(200), "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_debugging_config_never_times_out() {
    let mut h = Harness::new(MessengerConfig::debugging());
    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move { messenger.invoke_peer("slow", vec![]).await });

    let frame = h.next_frame().await;
    tokio::time::sleep(Duration::from_secs(3600)).await;
    h.peer_sends(json!({"id": frame["id"], "type":"succeeded", "body":"late but fine"}));

    assert_eq!(call.await.unwrap().unwrap(), Some(json!("late but fine")));
}

#[tokio::test]
async fn test_invoke_with_cancel_evicts_and_late_reply_is_spurious() {
    let mut h = Harness::new(MessengerConfig::default());
    let token = CancellationToken::new();
    let messenger = h.messenger.clone();
    let call = {
        let token = token.clone();
        tokio::spawn(async move { messenger.invoke_peer_with_cancel("work", vec![], &token).await })
    };

    let frame = h.next_frame().await;
    let id = frame["id"].as_str().unwrap().to_owned();
    token.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::Call(CallError::Cancelled(CancelReason::Explicit))));
    assert!(!h.messenger.is_pending(&id));

    h.peer_sends(json!({"id": id, "type":"succeeded", "body":1}));
    assert!(matches!(h.next_event().await, MessengerEvent::Spurious { .. }));
}

#[tokio::test]
async fn test_invoke_with_cancelled_token_sends_nothing() {
    let mut h = Harness::new(MessengerConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .messenger
        .invoke_peer_with_cancel("work", vec![], &token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(h.queued_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_call_future_evicts_pending_entry() {
    let h = Harness::new(MessengerConfig::default());

    let outcome =
        tokio::time::timeout(Duration::from_millis(10), h.messenger.invoke_peer("never", vec![])).await;

    assert!(outcome.is_err());
    assert!(!h.messenger.is_pending("host_1"));
    assert_eq!(h.messenger.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancel_all_pending_cancels_every_call() {
    let mut h = Harness::new(MessengerConfig::default());
    let calls: Vec<_> = (0..2)
        .map(|_| {
            let messenger = h.messenger.clone();
            tokio::spawn(async move { messenger.invoke_peer("x", vec![]).await })
        })
        .collect();
    h.next_frame().await;
    h.next_frame().await;

    assert_eq!(h.messenger.cancel_all_pending(), 2);
    for call in calls {
        assert!(call.await.unwrap().unwrap_err().is_cancelled());
    }
}

// =========================================================================
// ready / shutdown
// =========================================================================

#[tokio::test]
async fn test_ready_cancels_pending_and_reinjects() {
    let mut h = Harness::new(MessengerConfig::default());
    h.messenger.register("add", add).unwrap();
    h.messenger
        .register_with("hidden", add, MethodMetadata::hidden())
        .unwrap();
    let _inject = h.next_frame().await;

    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move { messenger.invoke_peer("pending", vec![]).await });
    let _invoke = h.next_frame().await;

    h.peer_sends(json!({"id":"ready","type":"control"}));

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::Call(CallError::Cancelled(CancelReason::PeerReset))));
    assert_eq!(h.next_event().await, MessengerEvent::Ready);
    assert_eq!(
        h.queued_frames(),
        vec![json!({"id":"inject","type":"control","body":{"name":"add","obsolete":null,"obsoleteMessage":null}})]
    );
}

#[tokio::test]
async fn test_unknown_control_is_ignored() {
    let mut h = Harness::new(MessengerConfig::default());

    h.peer_sends(json!({"id":"metadata","type":"control","body":{"x":1}}));

    assert!(h.queued_frames().is_empty());
    assert!(h.io.events.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_cancels_calls_and_refuses_new_ones() {
    let mut h = Harness::new(MessengerConfig::default());
    let messenger = h.messenger.clone();
    let call = tokio::spawn(async move { messenger.invoke_peer("x", vec![]).await });
    h.next_frame().await;

    h.messenger.shutdown();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::Call(CallError::Cancelled(CancelReason::Shutdown))));
    assert!(h.messenger.is_closed());
    assert!(matches!(
        h.messenger.invoke_peer("x", vec![]).await,
        Err(TetherError::Closed)
    ));
}
