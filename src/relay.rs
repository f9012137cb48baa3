use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::command::Command;
use crate::config::RelayConfig;
use crate::connection::{Connection, RelayError, SystemConnection};
use crate::error_handler::{DefaultErrorHandler, ErrorHandler};
use crate::events::EventBus;
use crate::frame::Frame;
use crate::transport::{ClientSink, CloseReason, TransportError};

struct Inner {
    config: Arc<RelayConfig>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn ClientSink>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    system: SystemConnection,
    events: EventBus,
    error_handler: Arc<dyn ErrorHandler>,
    expired: mpsc::UnboundedSender<String>,
    reaper: OnceLock<JoinHandle<()>>,
    shut_down: AtomicBool,
}

/// Process-wide router from session ids to [`Connection`]s.
///
/// Cheap to clone; clones share the registry. Frames for one session must be
/// dispatched sequentially; different sessions may dispatch concurrently.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

/// Options for [`Relay`] construction.
pub struct RelayBuilder {
    config: RelayConfig,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn ClientSink>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl RelayBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Open the system connection and start the relay.
    pub async fn build(self) -> Result<Relay, RelayError> {
        let config = Arc::new(self.config);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let system =
            SystemConnection::open(config.clone(), self.broker.clone(), expired_tx.clone()).await?;

        let inner = Arc::new(Inner {
            config,
            broker: self.broker,
            sink: self.sink,
            connections: Mutex::new(HashMap::new()),
            system,
            events: EventBus::new(),
            error_handler: self.error_handler,
            expired: expired_tx,
            reaper: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        });
        let _ = inner
            .reaper
            .set(tokio::spawn(reap(Arc::downgrade(&inner), expired_rx)));
        info!(system = %inner.system.session_id(), "relay started");
        Ok(Relay { inner })
    }
}

/// Closes sessions whose read heartbeat expired.
async fn reap(relay: Weak<Inner>, mut expired: mpsc::UnboundedReceiver<String>) {
    while let Some(session_id) = expired.recv().await {
        let Some(inner) = relay.upgrade() else {
            break;
        };
        Relay { inner }
            .close_with(&session_id, CloseReason::PolicyViolation)
            .await;
    }
}

impl Relay {
    pub fn builder(broker: Arc<dyn Broker>, sink: Arc<dyn ClientSink>) -> RelayBuilder {
        RelayBuilder {
            config: RelayConfig::default(),
            broker,
            sink,
            error_handler: Arc::new(DefaultErrorHandler),
        }
    }

    pub async fn new(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn ClientSink>,
    ) -> Result<Self, RelayError> {
        Self::builder(broker, sink).config(config).build().await
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Handlers notified after frames are handled successfully.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Route one inbound frame.
    ///
    /// CONNECT/STOMP creates the session's connection; DISCONNECT is handled
    /// and then tears the session down; anything else goes to the existing
    /// connection. Any failure is passed to the error handler, which by
    /// default ends the session, and is then returned.
    pub async fn dispatch(&self, session_id: &str, frame: Frame) -> Result<(), RelayError> {
        match self.handle(session_id, &frame).await {
            Ok(()) => {
                self.inner.events.fire(session_id, &frame).await;
                Ok(())
            }
            Err(e) => {
                self.inner
                    .error_handler
                    .on_error(self, session_id, &frame, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn handle(&self, session_id: &str, frame: &Frame) -> Result<(), RelayError> {
        match frame.command() {
            Some(Command::Connect | Command::Stomp) => {
                self.register(session_id).await?.connect(frame).await
            }
            Some(Command::Disconnect) => {
                let result = self.connection(session_id).await?.on(frame).await;
                self.close_with(session_id, CloseReason::Normal).await;
                result
            }
            // A stray heartbeat (such as the LF trailing a frame) is a no-op
            // even before CONNECT or after DISCONNECT.
            None => match self.connection(session_id).await {
                Ok(connection) => connection.on(frame).await,
                Err(_) => Ok(()),
            },
            Some(_) => self.connection(session_id).await?.on(frame).await,
        }
    }

    async fn register(&self, session_id: &str) -> Result<Arc<Connection>, RelayError> {
        if session_id == self.inner.config.system_session_id {
            return Err(RelayError::DuplicateSession(session_id.to_string()));
        }
        let mut connections = self.inner.connections.lock().await;
        match connections.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(RelayError::DuplicateSession(session_id.to_string())),
            Entry::Vacant(slot) => {
                let connection = Arc::new(Connection::new(
                    session_id,
                    self.inner.config.clone(),
                    self.inner.broker.clone(),
                    Some(self.inner.sink.clone()),
                    self.inner.expired.clone(),
                ));
                slot.insert(connection.clone());
                Ok(connection)
            }
        }
    }

    /// The live connection for `session_id`.
    pub async fn connection(&self, session_id: &str) -> Result<Arc<Connection>, RelayError> {
        self.inner
            .connections
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close a session normally.
    pub async fn close(&self, session_id: &str) {
        self.close_with(session_id, CloseReason::Normal).await;
    }

    /// Remove and tear down the session's connection if it is still
    /// registered, then ask the transport to drop the client. Safe to repeat.
    pub async fn close_with(&self, session_id: &str, reason: CloseReason) {
        let removed = self.inner.connections.lock().await.remove(session_id);
        if let Some(connection) = removed {
            connection.close().await;
            info!(session = %session_id, %reason, "session removed");
        }
        self.inner.sink.close(session_id, reason).await;
    }

    /// Server-initiated SEND through the system connection.
    pub async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        self.inner.system.send(frame).await
    }

    /// Write a frame straight to a client, bypassing its connection.
    pub async fn send_to_client(&self, session_id: &str, frame: Frame) -> Result<(), TransportError> {
        self.inner.sink.send_to_client(session_id, frame).await
    }

    /// Close every session and the system connection.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<_> = self.inner.connections.lock().await.drain().collect();
        for (session_id, connection) in connections {
            connection.close().await;
            self.inner.sink.close(&session_id, CloseReason::Normal).await;
        }
        self.inner.system.close().await;
        if let Some(reaper) = self.inner.reaper.get() {
            reaper.abort();
        }
        debug!("relay shut down");
    }
}
