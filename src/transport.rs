//! Boundary towards whatever carries frames to clients.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::frame::Frame;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No live transport connection for the session
    #[error("session '{0}' is not attached to a transport")]
    NotAttached(String),
    /// The transport failed to accept the frame
    #[error("transport closed: {0}")]
    Closed(String),
}

/// Why the relay asks the transport to drop a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// DISCONNECT or relay shutdown
    Normal,
    /// The client broke the protocol, including missed heartbeats
    PolicyViolation,
    /// A protocol or broker error ended the session
    Error,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Normal => "normal",
            CloseReason::PolicyViolation => "policy violation",
            CloseReason::Error => "error",
        })
    }
}

/// Outbound half of the transport: delivers frames to one client session.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send_to_client(&self, session_id: &str, frame: Frame) -> Result<(), TransportError>;

    /// Drop the client's transport connection. Must tolerate unknown ids.
    async fn close(&self, session_id: &str, reason: CloseReason);
}
