use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::broker::{
    AckMode, BrokerError, BrokerMessage, BrokerSession, Destination, MessageListener, Producer,
};
use crate::connection::RelayError;
use crate::factory::Factory;
use crate::frame::Frame;
use crate::heartbeat::HeartBeatMonitor;
use crate::transport::{ClientSink, TransportError};

/// Alias for the pending-ack table: broker message id -> delivered message.
pub(crate) type PendingAcks = Arc<Mutex<HashMap<String, BrokerMessage>>>;

/// Outbound path to one client. Every frame written here postpones the
/// connection's next heartbeat.
pub(crate) struct ClientChannel {
    session_id: String,
    sink: Option<Arc<dyn ClientSink>>,
    heart_beat: Arc<HeartBeatMonitor>,
}

impl ClientChannel {
    pub(crate) fn new(
        session_id: String,
        sink: Option<Arc<dyn ClientSink>>,
        heart_beat: Arc<HeartBeatMonitor>,
    ) -> Self {
        Self {
            session_id,
            sink,
            heart_beat,
        }
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| TransportError::NotAttached(self.session_id.clone()))?;
        sink.send_to_client(&self.session_id, frame).await?;
        self.heart_beat.reset_send();
        Ok(())
    }
}

/// Wraps one broker session on behalf of a connection.
///
/// Owns a producer created on first send. Sends are serialized through the
/// producer lock so at most one is in flight per wrapper.
pub struct Session {
    inner: Arc<dyn BrokerSession>,
    transacted: bool,
    ack_mode: AckMode,
    producer: Mutex<Option<Box<dyn Producer>>>,
    client: Arc<ClientChannel>,
    pending_acks: PendingAcks,
    factory: Factory,
}

impl Session {
    pub(crate) fn new(
        inner: Arc<dyn BrokerSession>,
        transacted: bool,
        ack_mode: AckMode,
        client: Arc<ClientChannel>,
        pending_acks: PendingAcks,
    ) -> Self {
        Self {
            inner,
            transacted,
            ack_mode,
            producer: Mutex::new(None),
            client,
            pending_acks,
            factory: Factory,
        }
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Translate a SEND frame and hand it to the broker.
    pub async fn send_to_broker(&self, frame: &Frame) -> Result<(), RelayError> {
        let (destination, message) = self.factory.to_message(frame)?;
        let mut producer = self.producer.lock().await;
        if producer.is_none() {
            *producer = Some(self.inner.create_producer().await?);
        }
        let producer = producer.as_ref().ok_or(BrokerError::Closed("producer"))?;
        producer.send(&destination, message).await?;
        trace!(%destination, "message sent to broker");
        Ok(())
    }

    /// Build the MESSAGE frame for a delivery. In client-ack mode the message
    /// is recorded as pending first, so an ACK can never outrun it.
    pub async fn deliver(
        &self,
        message: &BrokerMessage,
        subscription_id: &str,
    ) -> Result<Frame, RelayError> {
        if self.tracks_acks() {
            if let Some(id) = &message.id {
                self.pending_acks
                    .lock()
                    .await
                    .insert(id.clone(), message.clone());
            }
        }
        Ok(self.factory.to_frame(message, subscription_id)?)
    }

    pub async fn send_to_client(&self, frame: Frame) -> Result<(), RelayError> {
        self.client.send(frame).await
    }

    pub async fn create_consumer(
        &self,
        destination: &Destination,
        selector: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn crate::broker::Consumer>, RelayError> {
        Ok(self
            .inner
            .create_consumer(destination, selector, listener)
            .await?)
    }

    pub async fn commit(&self) -> Result<(), RelayError> {
        Ok(self.inner.commit().await?)
    }

    pub async fn rollback(&self) -> Result<(), RelayError> {
        Ok(self.inner.rollback().await?)
    }

    pub async fn acknowledge(&self, message: &BrokerMessage) -> Result<(), RelayError> {
        Ok(self.inner.acknowledge(message).await?)
    }

    /// Close the producer (if any) and the broker session.
    pub async fn close(&self) -> Result<(), RelayError> {
        if let Some(producer) = self.producer.lock().await.take() {
            producer.close().await?;
        }
        Ok(self.inner.close().await?)
    }

    fn tracks_acks(&self) -> bool {
        !self.transacted && self.ack_mode == AckMode::Client
    }
}
