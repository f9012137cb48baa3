//! TCP transport: one framed socket per client session.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::codec::StompCodec;
use crate::config::RelayConfig;
use crate::connection::RelayError;
use crate::frame::Frame;
use crate::relay::Relay;
use crate::transport::{ClientSink, CloseReason, TransportError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

enum Outbound {
    Frame(Frame),
    Close(CloseReason),
}

/// [`ClientSink`] writing to the sockets accepted by a [`Server`].
#[derive(Clone, Default)]
pub struct TcpSink {
    writers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Outbound>>>>,
}

impl TcpSink {
    async fn attach(&self, session_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.writers.lock().await.insert(session_id.to_string(), tx);
        rx
    }

    pub async fn attached(&self) -> usize {
        self.writers.lock().await.len()
    }
}

#[async_trait]
impl ClientSink for TcpSink {
    async fn send_to_client(&self, session_id: &str, frame: Frame) -> Result<(), TransportError> {
        let writers = self.writers.lock().await;
        let tx = writers
            .get(session_id)
            .ok_or_else(|| TransportError::NotAttached(session_id.to_string()))?;
        tx.send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed(session_id.to_string()))
    }

    async fn close(&self, session_id: &str, reason: CloseReason) {
        if let Some(tx) = self.writers.lock().await.remove(session_id) {
            let _ = tx.send(Outbound::Close(reason));
        }
    }
}

/// Accepts STOMP clients over TCP and feeds their frames to a [`Relay`].
pub struct Server {
    listener: TcpListener,
    relay: Relay,
    sink: TcpSink,
    max_frame_size: Option<usize>,
}

impl Server {
    /// Bind `config.bind_addr` and start a relay in front of `broker`.
    pub async fn bind(config: RelayConfig, broker: Arc<dyn Broker>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let sink = TcpSink::default();
        let max_frame_size = config.max_frame_size;
        let relay = Relay::builder(broker, Arc::new(sink.clone()))
            .config(config)
            .build()
            .await?;
        Ok(Self {
            listener,
            relay,
            sink,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn sink(&self) -> &TcpSink {
        &self.sink
    }

    /// Serve until `shutdown` completes, then shut the relay down.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        info!(addr = %self.local_addr()?, "listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let relay = self.relay.clone();
                    let sink = self.sink.clone();
                    let max = self.max_frame_size;
                    tokio::spawn(async move {
                        serve(relay, sink, stream, peer, max).await;
                    });
                }
            }
        }
        self.relay.shutdown().await;
        info!("server stopped");
        Ok(())
    }
}

/// Tears the session down if `serve` unwinds before its orderly close.
struct SessionGuard {
    relay: Option<Relay>,
    session_id: String,
}

impl SessionGuard {
    fn new(relay: &Relay, session_id: &str) -> Self {
        Self {
            relay: Some(relay.clone()),
            session_id: session_id.to_string(),
        }
    }

    fn disarm(&mut self) {
        self.relay = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let relay = match self.relay.take() {
            Some(relay) => relay,
            None => return,
        };
        let session_id = std::mem::take(&mut self.session_id);
        warn!(session = %session_id, "client task ended abnormally");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                relay.close_with(&session_id, CloseReason::Error).await;
            });
        }
    }
}

async fn serve(
    relay: Relay,
    sink: TcpSink,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_size: Option<usize>,
) {
    let session_id = Uuid::new_v4().to_string();
    debug!(session = %session_id, %peer, "client accepted");
    let mut outbound = sink.attach(&session_id).await;
    let mut guard = SessionGuard::new(&relay, &session_id);
    let codec = match max_frame_size {
        Some(max) => StompCodec::with_max_frame_size(max),
        None => StompCodec::new(),
    };
    let (mut writer, mut reader) = Framed::new(stream, codec).split();

    loop {
        tokio::select! {
            biased;
            out = outbound.recv() => match out {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = writer.send(frame).await {
                        debug!(session = %session_id, error = %e, "write failed");
                        break;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    debug!(session = %session_id, %reason, "closing client");
                    break;
                }
                None => break,
            },
            item = reader.next() => match item {
                Some(Ok(frame)) => {
                    // Failures already reached the error handler.
                    let _ = relay.dispatch(&session_id, frame).await;
                }
                Some(Err(e)) => {
                    warn!(session = %session_id, error = %e, "undecodable input, dropping client");
                    break;
                }
                None => break,
            },
        }
    }

    // Flush whatever was queued before the close (an ERROR frame, a RECEIPT).
    while let Ok(Outbound::Frame(frame)) = outbound.try_recv() {
        if writer.send(frame).await.is_err() {
            break;
        }
    }
    let _ = writer.close().await;
    guard.disarm();
    relay.close(&session_id).await;
    debug!(session = %session_id, "client gone");
}
