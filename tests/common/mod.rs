//! Shared helpers: a client sink that records everything the relay writes.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stomp_relay::{
    ClientSink, CloseReason, Command, Frame, InMemoryBroker, Relay, RelayConfig, TransportError,
    header,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug)]
pub enum Sent {
    Frame(String, Frame),
    Close(String, CloseReason),
}

pub struct RecordingSink {
    tx: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl ClientSink for RecordingSink {
    async fn send_to_client(&self, session_id: &str, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(Sent::Frame(session_id.to_string(), frame))
            .map_err(|_| TransportError::Closed(session_id.to_string()))
    }

    async fn close(&self, session_id: &str, reason: CloseReason) {
        let _ = self.tx.send(Sent::Close(session_id.to_string(), reason));
    }
}

pub struct Harness {
    pub relay: Relay,
    pub broker: InMemoryBroker,
    pub sent: mpsc::UnboundedReceiver<Sent>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(RelayConfig::default()).await
    }

    pub async fn with_config(config: RelayConfig) -> Self {
        let (tx, sent) = mpsc::unbounded_channel();
        let broker = InMemoryBroker::new();
        let relay = Relay::new(
            config,
            Arc::new(broker.clone()),
            Arc::new(RecordingSink { tx }),
        )
        .await
        .expect("relay start");
        Self {
            relay,
            broker,
            sent,
        }
    }

    /// Next thing the relay wrote, waiting up to one second.
    pub async fn next(&mut self) -> Sent {
        timeout(Duration::from_secs(1), self.sent.recv())
            .await
            .expect("timed out waiting for relay output")
            .expect("sink channel closed")
    }

    /// Next frame written to `session`, skipping output for other sessions
    /// and heartbeats.
    pub async fn next_frame_for(&mut self, session: &str) -> Frame {
        loop {
            match self.next().await {
                Sent::Frame(s, f) if s == session && !f.is_heartbeat() => return f,
                Sent::Close(s, reason) if s == session => {
                    panic!("session {} closed ({}) while waiting for a frame", s, reason)
                }
                _ => {}
            }
        }
    }

    /// Next close notice for `session`.
    pub async fn next_close_for(&mut self, session: &str) -> CloseReason {
        loop {
            if let Sent::Close(s, reason) = self.next().await {
                if s == session {
                    return reason;
                }
            }
        }
    }

    /// CONNECT `session` and return the CONNECTED frame.
    pub async fn connect(&mut self, session: &str) -> Frame {
        self.relay
            .dispatch(session, connect_frame("1.1,1.2"))
            .await
            .expect("connect");
        let connected = self.next_frame_for(session).await;
        assert_eq!(connected.command(), Some(Command::Connected));
        connected
    }

    pub async fn subscribe(&mut self, session: &str, id: &str, destination: &str, ack: &str) {
        let frame = Frame::builder(Command::Subscribe)
            .header(header::ID, id)
            .destination(destination)
            .header(header::ACK, ack)
            .build()
            .expect("subscribe frame");
        self.relay
            .dispatch(session, frame)
            .await
            .expect("subscribe");
    }

    pub async fn send(&mut self, session: &str, destination: &str, body: &str) {
        self.relay
            .dispatch(session, send_frame(destination, body))
            .await
            .expect("send");
    }
}

pub fn connect_frame(accept_version: &str) -> Frame {
    Frame::builder(Command::Connect)
        .header(header::ACCEPT_VERSION, accept_version)
        .header(header::HOST, "localhost")
        .build()
        .expect("connect frame")
}

pub fn send_frame(destination: &str, body: &str) -> Frame {
    Frame::builder(Command::Send)
        .destination(destination)
        .body(body.to_string())
        .build()
        .expect("send frame")
}

pub fn body_text(frame: &Frame) -> String {
    frame
        .body()
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default()
}
