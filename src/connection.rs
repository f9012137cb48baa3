use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tracing::{debug, info, warn};

use crate::broker::{AckMode, Broker, BrokerConnection, BrokerError, BrokerMessage};
use crate::command::{Command, header};
use crate::config::RelayConfig;
use crate::factory::Factory;
use crate::frame::{Frame, FrameError};
use crate::heartbeat::{
    HeartBeatHandler, HeartBeatMonitor, negotiate_heartbeats, parse_heartbeat_header,
};
use crate::session::{ClientChannel, PendingAcks, Session};
use crate::subscription::Subscription;
use crate::transport::{ClientSink, TransportError};

/// Errors returned while handling a client session.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Frame could not be built
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    /// Broker operation failed
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Client transport refused a frame
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session '{0}' is already connected")]
    DuplicateSession(String),
    #[error("session '{0}' is not connected")]
    UnknownSession(String),
    #[error("subscription '{0}' already exists")]
    DuplicateSubscription(String),
    #[error("subscription '{0}' does not exist")]
    UnknownSubscription(String),
    #[error("transaction '{0}' already exists")]
    DuplicateTransaction(String),
    #[error("transaction '{0}' does not exist")]
    UnknownTransaction(String),
    #[error("no such message '{0}' awaiting acknowledgement")]
    UnknownMessage(String),
    /// No protocol version in common with the client
    #[error("supported protocol versions are {supported}, client accepts {offered}")]
    UnsupportedVersion { offered: String, supported: String },
    #[error("unexpected command {0}")]
    UnexpectedCommand(String),
    /// Frame names a session other than the one handling it
    #[error("frame addressed to session '{found}', expected '{expected}'")]
    SessionMismatch { expected: String, found: String },
}

/// Forwards heartbeat timer events for one session.
struct Liveness {
    session_id: String,
    sink: Option<Arc<dyn ClientSink>>,
    expired: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl HeartBeatHandler for Liveness {
    async fn send_heartbeat(&self) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.send_to_client(&self.session_id, Frame::heartbeat()).await {
                debug!(session = %self.session_id, error = %e, "heartbeat not sent");
            }
        }
    }

    async fn read_timeout(&self) {
        warn!(session = %self.session_id, "no frame received within the heartbeat window");
        let _ = self.expired.send(self.session_id.clone());
    }
}

/// Server side of one client session.
///
/// A `Connection` owns its broker connection and everything derived from
/// it: the lazily opened auto-ack and client-ack sessions, one transacted
/// session per open transaction, the subscriptions and the table of
/// messages awaiting acknowledgement. Frames for one session must be handed
/// to [`Connection::on`] one at a time, in arrival order.
pub struct Connection {
    session_id: String,
    config: Arc<RelayConfig>,
    broker: Arc<dyn Broker>,
    client: Arc<ClientChannel>,
    heart_beat: Arc<HeartBeatMonitor>,
    factory: Factory,
    version: OnceLock<String>,
    broker_connection: OnceLock<Box<dyn BrokerConnection>>,
    default_session: OnceCell<Arc<Session>>,
    ack_session: OnceCell<Arc<Session>>,
    transaction_sessions: Mutex<HashMap<String, Arc<Session>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    pending_acks: PendingAcks,
    closed: AtomicBool,
}

impl Connection {
    /// Create an unconnected session. `sink` is `None` for the system
    /// connection, which never writes to a client. Expired read heartbeats
    /// are reported by sending the session id on `expired`.
    pub(crate) fn new(
        session_id: impl Into<String>,
        config: Arc<RelayConfig>,
        broker: Arc<dyn Broker>,
        sink: Option<Arc<dyn ClientSink>>,
        expired: mpsc::UnboundedSender<String>,
    ) -> Self {
        let session_id = session_id.into();
        let heart_beat = Arc::new(HeartBeatMonitor::new(Arc::new(Liveness {
            session_id: session_id.clone(),
            sink: sink.clone(),
            expired,
        })));
        let client = Arc::new(ClientChannel::new(
            session_id.clone(),
            sink,
            heart_beat.clone(),
        ));
        Self {
            session_id,
            config,
            broker,
            client,
            heart_beat,
            factory: Factory,
            version: OnceLock::new(),
            broker_connection: OnceLock::new(),
            default_session: OnceCell::new(),
            ack_session: OnceCell::new(),
            transaction_sessions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            pending_acks: PendingAcks::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Negotiated protocol version, once connected.
    pub fn version(&self) -> Option<&str> {
        self.version.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn heart_beat_running(&self) -> bool {
        self.heart_beat.is_running()
    }

    pub async fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.subscriptions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn transaction_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .transaction_sessions
            .lock()
            .await
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Broker ids of messages delivered in client-ack mode and not yet
    /// acknowledged.
    pub async fn pending_ack_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.pending_acks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// CONNECT/STOMP handshake: pick the newest common version, negotiate
    /// heartbeats, open the broker connection, reply CONNECTED and arm the
    /// heartbeat monitor.
    pub async fn connect(&self, frame: &Frame) -> Result<(), RelayError> {
        let offered = frame.headers().get_all(header::ACCEPT_VERSION);
        let version = self
            .config
            .negotiate_version(&offered)
            .ok_or_else(|| RelayError::UnsupportedVersion {
                offered: offered.join(","),
                supported: self.config.versions.join(","),
            })?
            .to_string();

        self.open_broker(frame.header(header::LOGIN), frame.header(header::PASSCODE))
            .await?;
        let _ = self.version.set(version.clone());

        let requested = frame.header(header::HEART_BEAT).map(parse_heartbeat_header);
        let (read_ms, write_ms) = requested
            .map(|(cx, cy)| negotiate_heartbeats(cx, cy, self.config.min_heartbeat_ms))
            .unwrap_or((0, 0));

        let server = self
            .config
            .server_name
            .as_deref()
            .or_else(|| frame.header(header::HOST))
            .unwrap_or_default();
        let connected = self.factory.connected(
            &version,
            &self.session_id,
            server,
            requested.map(|_| (write_ms, read_ms)),
        )?;
        self.client.send(connected).await?;
        self.heart_beat.start(read_ms, write_ms);
        info!(session = %self.session_id, %version, read_ms, write_ms, "session connected");

        self.send_receipt(frame).await
    }

    /// Handle one frame from the client. A heartbeat only postpones the read
    /// deadline. On success, a `receipt` header is answered with RECEIPT.
    pub async fn on(&self, frame: &Frame) -> Result<(), RelayError> {
        self.heart_beat.reset_read();
        let Some(command) = frame.command() else {
            return Ok(());
        };

        let result = match command {
            Command::Send => self.send(frame).await,
            Command::Subscribe => self.subscribe(frame).await,
            Command::Unsubscribe => self.unsubscribe(frame).await,
            Command::Begin => self.begin(frame).await,
            Command::Commit => self.commit(frame).await,
            Command::Abort => self.abort(frame).await,
            Command::Ack => self.ack(frame).await,
            Command::Nack => self.nack(frame).await,
            Command::Disconnect => Ok(()),
            Command::Connect
            | Command::Stomp
            | Command::Connected
            | Command::Error
            | Command::Message
            | Command::Receipt => Err(RelayError::UnexpectedCommand(command.to_string())),
        };

        match result {
            Ok(()) => self.send_receipt(frame).await,
            Err(e) => {
                warn!(session = %self.session_id, %command, error = %e, "frame handling failed");
                Err(e)
            }
        }
    }

    /// Tear everything down: heartbeat timers, subscriptions, open
    /// transactions (rolled back), sessions and the broker connection.
    /// Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heart_beat.close();

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for (id, subscription) in subscriptions {
            if let Err(e) = subscription.close().await {
                debug!(session = %self.session_id, subscription = %id, error = %e, "subscription close failed");
            }
        }

        let transactions = std::mem::take(&mut *self.transaction_sessions.lock().await);
        for (tx, session) in transactions {
            if let Err(e) = session.rollback().await {
                debug!(session = %self.session_id, transaction = %tx, error = %e, "rollback on close failed");
            }
            if let Err(e) = session.close().await {
                debug!(session = %self.session_id, transaction = %tx, error = %e, "session close failed");
            }
        }

        for session in [self.default_session.get(), self.ack_session.get()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = session.close().await {
                debug!(session = %self.session_id, error = %e, "session close failed");
            }
        }
        self.pending_acks.lock().await.clear();

        if let Some(conn) = self.broker_connection.get() {
            if let Err(e) = conn.close().await {
                debug!(session = %self.session_id, error = %e, "broker connection close failed");
            }
        }
        info!(session = %self.session_id, "session closed");
    }

    async fn open_broker(
        &self,
        login: Option<&str>,
        passcode: Option<&str>,
    ) -> Result<(), RelayError> {
        let conn = self.broker.connect(login, passcode).await?;
        if let Err(conn) = self.broker_connection.set(conn) {
            let _ = conn.close().await;
            return Err(RelayError::DuplicateSession(self.session_id.clone()));
        }
        Ok(())
    }

    fn broker_connection(&self) -> Result<&dyn BrokerConnection, RelayError> {
        self.broker_connection
            .get()
            .map(|c| c.as_ref())
            .ok_or_else(|| RelayError::UnknownSession(self.session_id.clone()))
    }

    async fn open_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<Session>, RelayError> {
        let inner = self
            .broker_connection()?
            .create_session(transacted, ack_mode)
            .await?;
        Ok(Arc::new(Session::new(
            inner,
            transacted,
            ack_mode,
            self.client.clone(),
            self.pending_acks.clone(),
        )))
    }

    async fn default_session(&self) -> Result<Arc<Session>, RelayError> {
        self.default_session
            .get_or_try_init(|| self.open_session(false, AckMode::Auto))
            .await
            .cloned()
    }

    async fn ack_session(&self) -> Result<Arc<Session>, RelayError> {
        self.ack_session
            .get_or_try_init(|| self.open_session(false, AckMode::Client))
            .await
            .cloned()
    }

    /// Session selected by the frame's `ack` header.
    async fn session_for_ack(&self, frame: &Frame) -> Result<Arc<Session>, RelayError> {
        match frame.header(header::ACK) {
            Some("client") | Some("client-individual") => self.ack_session().await,
            _ => self.default_session().await,
        }
    }

    /// Session selected by the frame's `transaction` header, falling back to
    /// the `ack` header.
    async fn session_for(&self, frame: &Frame) -> Result<Arc<Session>, RelayError> {
        match frame.transaction() {
            Some(tx) => self
                .transaction_sessions
                .lock()
                .await
                .get(tx)
                .cloned()
                .ok_or_else(|| RelayError::UnknownTransaction(tx.to_string())),
            None => self.session_for_ack(frame).await,
        }
    }

    async fn send_receipt(&self, frame: &Frame) -> Result<(), RelayError> {
        if let Some(receipt) = frame.receipt() {
            self.client.send(self.factory.receipt(receipt)?).await?;
        }
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<(), RelayError> {
        self.session_for(frame).await?.send_to_broker(frame).await
    }

    async fn subscribe(&self, frame: &Frame) -> Result<(), RelayError> {
        let id = frame.id().unwrap_or_default().to_string();
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&id) {
            return Err(RelayError::DuplicateSubscription(id));
        }
        let session = self.session_for_ack(frame).await?;
        let subscription = Subscription::open(session, &self.session_id, frame).await?;
        subscriptions.insert(id, subscription);
        Ok(())
    }

    async fn unsubscribe(&self, frame: &Frame) -> Result<(), RelayError> {
        let id = frame.id().unwrap_or_default();
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| RelayError::UnknownSubscription(id.to_string()))?;
        subscription.close().await
    }

    async fn begin(&self, frame: &Frame) -> Result<(), RelayError> {
        let tx = frame.transaction().unwrap_or_default().to_string();
        let mut transactions = self.transaction_sessions.lock().await;
        if transactions.contains_key(&tx) {
            return Err(RelayError::DuplicateTransaction(tx));
        }
        let session = self.open_session(true, AckMode::Auto).await?;
        debug!(session = %self.session_id, transaction = %tx, "transaction started");
        transactions.insert(tx, session);
        Ok(())
    }

    async fn take_transaction(&self, frame: &Frame) -> Result<Arc<Session>, RelayError> {
        let tx = frame.transaction().unwrap_or_default();
        self.transaction_sessions
            .lock()
            .await
            .remove(tx)
            .ok_or_else(|| RelayError::UnknownTransaction(tx.to_string()))
    }

    async fn commit(&self, frame: &Frame) -> Result<(), RelayError> {
        let session = self.take_transaction(frame).await?;
        session.commit().await?;
        session.close().await
    }

    async fn abort(&self, frame: &Frame) -> Result<(), RelayError> {
        let session = self.take_transaction(frame).await?;
        session.rollback().await?;
        session.close().await
    }

    async fn take_pending(&self, frame: &Frame) -> Result<BrokerMessage, RelayError> {
        let id = frame.id().unwrap_or_default();
        self.pending_acks
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| RelayError::UnknownMessage(id.to_string()))
    }

    async fn ack(&self, frame: &Frame) -> Result<(), RelayError> {
        let message = self.take_pending(frame).await?;
        self.ack_session().await?.acknowledge(&message).await
    }

    async fn nack(&self, frame: &Frame) -> Result<(), RelayError> {
        let message = self.take_pending(frame).await?;
        debug!(session = %self.session_id, message = ?message.id, "message rejected by client");
        Ok(())
    }
}

/// The relay's own connection for server-initiated messages.
///
/// It only sends to the broker and has no client to write to. Frames must
/// either carry no `session` header or carry the system session id; in the
/// latter case the header is dropped and the message goes out as a
/// broadcast.
pub struct SystemConnection {
    connection: Connection,
}

impl SystemConnection {
    pub(crate) async fn open(
        config: Arc<RelayConfig>,
        broker: Arc<dyn Broker>,
        expired: mpsc::UnboundedSender<String>,
    ) -> Result<Self, RelayError> {
        let connection = Connection::new(
            config.system_session_id.clone(),
            config.clone(),
            broker,
            None,
            expired,
        );
        connection.open_broker(None, None).await?;
        if let Some(version) = config.versions.first() {
            let _ = connection.version.set(version.clone());
        }
        debug!(session = %connection.session_id, "system connection opened");
        Ok(Self { connection })
    }

    pub fn session_id(&self) -> &str {
        &self.connection.session_id
    }

    pub async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        if frame.command() != Some(Command::Send) {
            let found = frame
                .command()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "heartbeat".to_string());
            return Err(RelayError::UnexpectedCommand(found));
        }
        let frame = match frame.session() {
            None => frame,
            Some(s) if s == self.session_id() => match frame.to_builder() {
                Some(builder) => builder.remove_header(header::SESSION).build()?,
                None => frame,
            },
            Some(s) => {
                return Err(RelayError::SessionMismatch {
                    expected: self.session_id().to_string(),
                    found: s.to_string(),
                });
            }
        };
        self.connection.default_session().await?.send_to_broker(&frame).await
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}
