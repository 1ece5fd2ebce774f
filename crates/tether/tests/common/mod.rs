//! Shared harness: a messenger plus the peer's view of its channels.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;
use tether::{Messenger, MessengerConfig, MessengerEvent, MessengerIo};

pub struct Harness {
    pub messenger: Messenger,
    pub io: MessengerIo,
}

impl Harness {
    pub fn new(config: MessengerConfig) -> Self {
        let (messenger, io) = Messenger::new(config);
        Self { messenger, io }
    }

    /// Delivers a frame as if the peer had sent it.
    pub fn peer_sends(&self, frame: Value) {
        self.messenger.received_request(&frame.to_string());
    }

    /// Next frame the host sent, raw.
    pub async fn next_text(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(60), self.io.outbound.recv())
            .await
            .expect("no frame within timeout")
            .expect("outbound channel closed")
    }

    /// Next frame the host sent, parsed.
    pub async fn next_frame(&mut self) -> Value {
        let text = self.next_text().await;
        serde_json::from_str(&text).expect("host sent invalid JSON")
    }

    /// Next frame that isn't a control message.
    pub async fn next_call_frame(&mut self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] != "control" {
                return frame;
            }
        }
    }

    pub async fn next_event(&mut self) -> MessengerEvent {
        tokio::time::timeout(Duration::from_secs(60), self.io.events.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed")
    }

    /// Every frame already queued, without waiting.
    pub fn queued_frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.io.outbound.try_recv() {
            frames.push(serde_json::from_str(&text).expect("host sent invalid JSON"));
        }
        frames
    }
}
