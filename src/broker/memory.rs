//! In-process broker implementing the capability traits.
//!
//! Queues hand each message to one matching consumer (round robin) and keep
//! a backlog while nobody matches; topics fan out to every matching consumer
//! and keep nothing. Transacted sessions buffer sends until commit. Messages
//! delivered to a client-acknowledge session stay unacknowledged until
//! `acknowledge`; closing the session puts unacknowledged queue messages
//! back on their queue flagged as redelivered.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use super::selector::Selector;
use super::{
    AckMode, Broker, BrokerConnection, BrokerError, BrokerMessage, BrokerSession, Consumer,
    Destination, MessageListener, Producer,
};

/// Acknowledged message ids kept for inspection.
pub const ACK_HISTORY: usize = 256;

struct ConsumerEntry {
    id: u64,
    selector: Selector,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct DestinationState {
    consumers: Vec<ConsumerEntry>,
    backlog: VecDeque<BrokerMessage>,
    cursor: usize,
}

#[derive(Default)]
struct BrokerState {
    destinations: Mutex<HashMap<Destination, DestinationState>>,
    acknowledged: Mutex<VecDeque<String>>,
    consumer_ids: AtomicU64,
}

impl BrokerState {
    async fn publish(&self, destination: &Destination, mut message: BrokerMessage) {
        message.destination = Some(destination.clone());
        let mut map = self.destinations.lock().await;
        let state = map.entry(destination.clone()).or_default();

        if destination.is_topic() {
            for entry in state.consumers.iter().filter(|c| c.selector.matches(&message)) {
                let _ = entry.tx.send(message.clone());
            }
            return;
        }

        let n = state.consumers.len();
        for step in 0..n {
            let idx = (state.cursor + step) % n;
            let entry = &state.consumers[idx];
            if entry.selector.matches(&message) && entry.tx.send(message.clone()).is_ok() {
                state.cursor = (idx + 1) % n;
                return;
            }
        }
        trace!(%destination, "no matching consumer, message kept in backlog");
        state.backlog.push_back(message);
    }

    async fn record_ack(&self, id: String) {
        let mut acknowledged = self.acknowledged.lock().await;
        if acknowledged.len() == ACK_HISTORY {
            acknowledged.pop_front();
        }
        acknowledged.push_back(id);
    }

    async fn add_consumer(&self, destination: &Destination, entry: ConsumerEntry) {
        let mut map = self.destinations.lock().await;
        let state = map.entry(destination.clone()).or_default();
        if !destination.is_topic() {
            let backlog = std::mem::take(&mut state.backlog);
            for message in backlog {
                if entry.selector.matches(&message) {
                    let _ = entry.tx.send(message);
                } else {
                    state.backlog.push_back(message);
                }
            }
        }
        state.consumers.push(entry);
    }

    async fn remove_consumer(&self, destination: &Destination, id: u64) {
        let mut map = self.destinations.lock().await;
        if let Some(state) = map.get_mut(destination) {
            state.consumers.retain(|c| c.id != id);
            state.cursor = 0;
        }
    }
}

/// In-memory [`Broker`]. Cloning shares the same destinations.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live consumers on `destination`.
    pub async fn consumer_count(&self, destination: &Destination) -> usize {
        let map = self.state.destinations.lock().await;
        map.get(destination).map(|s| s.consumers.len()).unwrap_or(0)
    }

    /// Messages waiting on a queue for a matching consumer.
    pub async fn backlog(&self, destination: &Destination) -> Vec<BrokerMessage> {
        let map = self.state.destinations.lock().await;
        map.get(destination)
            .map(|s| s.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of the latest [`ACK_HISTORY`] acknowledged messages, oldest first.
    pub async fn acknowledged(&self) -> Vec<String> {
        self.state.acknowledged.lock().await.iter().cloned().collect()
    }

    /// Publish directly, bypassing any session.
    pub async fn publish(&self, destination: &Destination, message: BrokerMessage) {
        let mut message = message;
        if message.id.is_none() {
            message.id = Some(new_message_id());
        }
        self.state.publish(destination, message).await;
    }
}

fn new_message_id() -> String {
    format!("ID:{}", Uuid::new_v4())
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(
        &self,
        login: Option<&str>,
        _passcode: Option<&str>,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        debug!(login = login.unwrap_or(""), "in-memory broker connection opened");
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            sessions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    sessions: Mutex<Vec<Arc<SessionState>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("connection"));
        }
        let session = Arc::new(SessionState {
            broker: self.state.clone(),
            transacted,
            ack_mode,
            pending_sends: Mutex::new(Vec::new()),
            unacked: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| !s.closed.load(Ordering::SeqCst));
        sessions.push(session.clone());
        Ok(Arc::new(MemorySession(session)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        for session in sessions {
            session.close().await;
        }
        Ok(())
    }
}

struct SessionState {
    broker: Arc<BrokerState>,
    transacted: bool,
    ack_mode: AckMode,
    pending_sends: Mutex<Vec<(Destination, BrokerMessage)>>,
    unacked: Mutex<Vec<BrokerMessage>>,
    consumers: Mutex<Vec<(Destination, u64, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl SessionState {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed("session"))
        } else {
            Ok(())
        }
    }

    fn tracks_acks(&self) -> bool {
        !self.transacted && self.ack_mode == AckMode::Client
    }

    async fn send(
        &self,
        destination: &Destination,
        mut message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        self.check_open()?;
        message.id = Some(new_message_id());
        if self.transacted {
            self.pending_sends
                .lock()
                .await
                .push((destination.clone(), message));
        } else {
            self.broker.publish(destination, message).await;
        }
        Ok(())
    }

    async fn remove_consumer(&self, id: u64) {
        let mut consumers = self.consumers.lock().await;
        if let Some(pos) = consumers.iter().position(|(_, cid, _)| *cid == id) {
            let (destination, _, handle) = consumers.remove(pos);
            handle.abort();
            self.broker.remove_consumer(&destination, id).await;
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for (destination, id, handle) in consumers {
            handle.abort();
            self.broker.remove_consumer(&destination, id).await;
        }
        self.pending_sends.lock().await.clear();
        let unacked = std::mem::take(&mut *self.unacked.lock().await);
        for mut message in unacked {
            if let Some(destination) = message.destination.clone().filter(|d| !d.is_topic()) {
                message.redelivered = true;
                self.broker.publish(&destination, message).await;
            }
        }
    }
}

struct MemorySession(Arc<SessionState>);

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_producer(&self) -> Result<Box<dyn Producer>, BrokerError> {
        self.0.check_open()?;
        Ok(Box::new(MemoryProducer {
            session: self.0.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        self.0.check_open()?;
        let selector =
            Selector::parse(selector).map_err(|e| BrokerError::InvalidSelector(e.to_string()))?;
        let id = self.0.broker.consumer_ids.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerMessage>();

        let session = self.0.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if session.tracks_acks() {
                    session.unacked.lock().await.push(message.clone());
                }
                listener.on_message(message).await;
            }
        });

        self.0
            .consumers
            .lock()
            .await
            .push((destination.clone(), id, handle));
        self.0
            .broker
            .add_consumer(destination, ConsumerEntry { id, selector, tx })
            .await;
        debug!(%destination, consumer = id, "consumer created");
        Ok(Box::new(MemoryConsumer {
            session: self.0.clone(),
            id,
        }))
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.0.check_open()?;
        if !self.0.transacted {
            return Err(BrokerError::IllegalState("session is not transacted".into()));
        }
        let sends = std::mem::take(&mut *self.0.pending_sends.lock().await);
        for (destination, message) in sends {
            self.0.broker.publish(&destination, message).await;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        self.0.check_open()?;
        if !self.0.transacted {
            return Err(BrokerError::IllegalState("session is not transacted".into()));
        }
        self.0.pending_sends.lock().await.clear();
        Ok(())
    }

    async fn acknowledge(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        self.0.check_open()?;
        let id = message
            .id
            .clone()
            .ok_or_else(|| BrokerError::IllegalState("message has no id".into()))?;
        let mut unacked = self.0.unacked.lock().await;
        match unacked
            .iter()
            .position(|m| m.id.as_deref() == Some(id.as_str()))
        {
            Some(pos) => {
                unacked.remove(pos);
                self.0.broker.record_ack(id).await;
                Ok(())
            }
            None => Err(BrokerError::IllegalState(format!(
                "message {} is not awaiting acknowledgement",
                id
            ))),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.0.close().await;
        Ok(())
    }
}

struct MemoryProducer {
    session: Arc<SessionState>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(
        &self,
        destination: &Destination,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        self.session.send(destination, message).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryConsumer {
    session: Arc<SessionState>,
    id: u64,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn close(&self) -> Result<(), BrokerError> {
        self.session.remove_consumer(self.id).await;
        Ok(())
    }
}
