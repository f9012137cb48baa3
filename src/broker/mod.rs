//! Capability boundary towards the backend message broker.
//!
//! The relay never talks to a concrete broker; it drives these traits. The
//! shapes follow a JMS-like model: a connection hands out sessions (each
//! either transacted or using an acknowledgement mode), sessions hand out
//! producers and consumers, and consumers push messages to a
//! [`MessageListener`] from the broker's own delivery tasks.

pub mod memory;
pub mod selector;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::InMemoryBroker;

/// Errors raised by broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Destination string not understood
    #[error("invalid destination '{0}'")]
    InvalidDestination(String),
    /// Temporary destinations are not routed by the relay
    #[error("temporary destinations are not supported: '{0}'")]
    TemporaryDestination(String),
    /// Selector expression could not be parsed
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    /// Operation on a closed connection, session, producer or consumer
    #[error("{0} is closed")]
    Closed(&'static str),
    /// Operation not valid in the session's mode
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Failure reported by the backend
    #[error("broker failure: {0}")]
    Backend(String),
}

/// A queue or topic on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub const QUEUE_PREFIX: &'static str = "/queue/";
    pub const TOPIC_PREFIX: &'static str = "/topic/";
    const TEMP_PREFIXES: [&'static str; 2] = ["/temp-queue/", "/temp-topic/"];

    /// Resolve a STOMP destination path (`/queue/<name>` or `/topic/<name>`).
    pub fn parse(path: &str) -> Result<Self, BrokerError> {
        if Self::TEMP_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return Err(BrokerError::TemporaryDestination(path.to_string()));
        }
        let (name, build): (_, fn(String) -> Destination) =
            if let Some(name) = path.strip_prefix(Self::QUEUE_PREFIX) {
                (name, Destination::Queue)
            } else if let Some(name) = path.strip_prefix(Self::TOPIC_PREFIX) {
                (name, Destination::Topic)
            } else {
                return Err(BrokerError::InvalidDestination(path.to_string()));
            };
        if name.is_empty() {
            return Err(BrokerError::InvalidDestination(path.to_string()));
        }
        Ok(build(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(n) | Destination::Topic(n) => n,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(n) => write!(f, "{}{}", Self::QUEUE_PREFIX, n),
            Destination::Topic(n) => write!(f, "{}{}", Self::TOPIC_PREFIX, n),
        }
    }
}

/// Acknowledgement mode of a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// The broker considers a message consumed once delivered
    Auto,
    /// The client acknowledges each message explicitly
    Client,
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Binary(Bytes),
}

impl Default for MessageBody {
    fn default() -> Self {
        MessageBody::Text(String::new())
    }
}

/// A broker-side message.
///
/// `id` is assigned by the broker when the message is sent. Optional header
/// fields are only set when the producer (or broker) provided them.
/// `properties` keep the insertion order of the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    pub id: Option<String>,
    pub destination: Option<Destination>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub message_type: Option<String>,
    /// Absolute expiry in epoch milliseconds
    pub expiration: Option<u64>,
    pub priority: Option<u8>,
    /// Send time in epoch milliseconds
    pub timestamp: Option<u64>,
    pub redelivered: bool,
    pub properties: Vec<(String, String)>,
    pub body: MessageBody,
}

impl BrokerMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(body.into()),
            ..Default::default()
        }
    }

    pub fn binary(body: impl Into<Bytes>) -> Self {
        Self {
            body: MessageBody::Binary(body.into()),
            ..Default::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.properties.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value.into(),
            None => self.properties.push((name, value.into())),
        }
    }
}

/// Entry point: opens connections for a client's credentials.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        login: Option<&str>,
        passcode: Option<&str>,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a session. `ack_mode` is ignored for transacted sessions.
    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_producer(&self) -> Result<Box<dyn Producer>, BrokerError>;

    /// Start consuming `destination`, filtered by a selector expression.
    /// Messages are pushed to `listener` from a broker-owned task.
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn Consumer>, BrokerError>;

    async fn commit(&self) -> Result<(), BrokerError>;

    async fn rollback(&self) -> Result<(), BrokerError>;

    /// Acknowledge a message delivered through this session.
    async fn acknowledge(&self, message: &BrokerMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        message: BrokerMessage,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Receives messages for one consumer.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: BrokerMessage);
}
