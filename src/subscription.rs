use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::selector::Selector;
use crate::broker::{BrokerError, BrokerMessage, Consumer, Destination, MessageListener};
use crate::command::header;
use crate::connection::RelayError;
use crate::frame::Frame;
use crate::session::Session;

/// One client subscription: a broker consumer on a resolved destination,
/// filtered to messages that are broadcast or addressed to this session.
pub struct Subscription {
    id: String,
    destination: Destination,
    selector: String,
    consumer: Box<dyn Consumer>,
}

impl Subscription {
    /// Open the consumer for a SUBSCRIBE frame.
    pub(crate) async fn open(
        session: Arc<Session>,
        session_id: &str,
        frame: &Frame,
    ) -> Result<Self, RelayError> {
        let id = frame
            .id()
            .ok_or_else(|| RelayError::UnknownSubscription(String::new()))?
            .to_string();
        let path = frame.destination().unwrap_or_default();
        let destination = Destination::parse(path)?;
        let selector = routing_selector(session_id, frame.header(header::SELECTOR))?;

        let listener = Arc::new(Delivery {
            session: session.clone(),
            subscription_id: id.clone(),
        });
        let consumer = session
            .create_consumer(&destination, &selector, listener)
            .await?;
        debug!(subscription = %id, %destination, %selector, "subscription opened");
        Ok(Self {
            id,
            destination,
            selector,
            consumer,
        })
    }

    /// Returns the client's subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the destination this subscription consumes from.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// The selector handed to the broker.
    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub async fn close(&self) -> Result<(), RelayError> {
        Ok(self.consumer.close().await?)
    }
}

/// Selector admitting broadcast messages and those addressed to
/// `session_id`, narrowed by the client's own selector if it sent one.
///
/// The client selector must parse as one complete expression on its own,
/// so it cannot close the routing group and widen delivery.
pub fn routing_selector(
    session_id: &str,
    user_selector: Option<&str>,
) -> Result<String, BrokerError> {
    let routing = format!(
        "{s} IS NULL OR {s} = '{id}'",
        s = header::SESSION,
        id = session_id.replace('\'', "''")
    );
    match user_selector.map(str::trim).filter(|s| !s.is_empty()) {
        Some(user) => {
            Selector::parse(user).map_err(|e| BrokerError::InvalidSelector(e.to_string()))?;
            Ok(format!("({}) AND ({})", routing, user))
        }
        None => Ok(routing),
    }
}

struct Delivery {
    session: Arc<Session>,
    subscription_id: String,
}

#[async_trait]
impl MessageListener for Delivery {
    async fn on_message(&self, message: BrokerMessage) {
        let frame = match self.session.deliver(&message, &self.subscription_id).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(subscription = %self.subscription_id, error = %e, "unable to convert message");
                return;
            }
        };
        // The client may already be gone; delivery is best effort.
        if let Err(e) = self.session.send_to_client(frame).await {
            warn!(subscription = %self.subscription_id, error = %e, "unable to deliver message");
        }
    }
}
