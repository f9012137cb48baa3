use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connection::RelayError;
use crate::factory::Factory;
use crate::frame::Frame;
use crate::relay::Relay;
use crate::transport::CloseReason;

/// Turns a failed frame into a terminal, client-visible failure.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, relay: &Relay, session_id: &str, frame: &Frame, error: &RelayError);
}

/// Sends one ERROR frame (echoing the frame's receipt, if any) and closes
/// the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn on_error(&self, relay: &Relay, session_id: &str, frame: &Frame, error: &RelayError) {
        let command = frame
            .command()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "heartbeat".to_string());
        let detail = format!("{} failed: {}\n", command, error);
        match Factory.error(&error.to_string(), frame.receipt(), &detail) {
            Ok(error_frame) => {
                if let Err(e) = relay.send_to_client(session_id, error_frame).await {
                    debug!(session = %session_id, error = %e, "ERROR frame not delivered");
                }
            }
            Err(e) => warn!(session = %session_id, error = %e, "unable to build ERROR frame"),
        }
        relay.close_with(session_id, CloseReason::Error).await;
    }
}
