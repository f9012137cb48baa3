use std::fmt;
use std::str::FromStr;

/// Canonical STOMP header names used by the relay.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const DESTINATION: &str = "destination";
    pub const EXPIRATION: &str = "expiration";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const PERSISTENT: &str = "persistent";
    pub const PRIORITY: &str = "priority";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const REDELIVERED: &str = "redelivered";
    pub const REPLY_TO: &str = "reply-to";
    pub const SELECTOR: &str = "selector";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TIMESTAMP: &str = "timestamp";
    pub const TRANSACTION: &str = "transaction";
    pub const TYPE: &str = "type";
    pub const VERSION: &str = "version";
}

/// STOMP protocol commands.
///
/// Each command carries a fixed set of structural capabilities (does it
/// carry a destination, a body, a subscription id, is it transactional) and
/// a list of headers that must be present for a frame to be valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Abort,
    Ack,
    Begin,
    Commit,
    Connect,
    Connected,
    Disconnect,
    Error,
    Message,
    Nack,
    Receipt,
    Send,
    Stomp,
    Subscribe,
    Unsubscribe,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::Abort,
        Command::Ack,
        Command::Begin,
        Command::Commit,
        Command::Connect,
        Command::Connected,
        Command::Disconnect,
        Command::Error,
        Command::Message,
        Command::Nack,
        Command::Receipt,
        Command::Send,
        Command::Stomp,
        Command::Subscribe,
        Command::Unsubscribe,
    ];

    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Abort => "ABORT",
            Command::Ack => "ACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Disconnect => "DISCONNECT",
            Command::Error => "ERROR",
            Command::Message => "MESSAGE",
            Command::Nack => "NACK",
            Command::Receipt => "RECEIPT",
            Command::Send => "SEND",
            Command::Stomp => "STOMP",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
        }
    }

    /// Frames only a server may emit.
    pub fn is_server_originated(&self) -> bool {
        matches!(
            self,
            Command::Connected | Command::Error | Command::Message | Command::Receipt
        )
    }

    pub fn has_destination(&self) -> bool {
        matches!(self, Command::Message | Command::Send | Command::Subscribe)
    }

    pub fn has_subscription_id(&self) -> bool {
        matches!(
            self,
            Command::Message | Command::Subscribe | Command::Unsubscribe
        )
    }

    pub fn has_body(&self) -> bool {
        matches!(self, Command::Send | Command::Message | Command::Error)
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, Command::Begin | Command::Commit | Command::Abort)
    }

    /// Headers a frame with this command must carry.
    pub fn mandatory_headers(&self) -> &'static [&'static str] {
        match self {
            Command::Ack | Command::Nack => &[header::ID],
            Command::Begin | Command::Commit | Command::Abort => &[header::TRANSACTION],
            Command::Connect | Command::Stomp => &[header::ACCEPT_VERSION, header::HOST],
            Command::Connected => &[header::VERSION],
            Command::Message => &[header::DESTINATION, header::MESSAGE_ID],
            Command::Receipt => &[header::RECEIPT_ID],
            Command::Send => &[header::DESTINATION],
            Command::Subscribe => &[header::DESTINATION, header::ID],
            Command::Unsubscribe => &[header::ID],
            Command::Disconnect | Command::Error => &[],
        }
    }

    /// STOMP 1.2 leaves CONNECT and CONNECTED header values unescaped.
    pub(crate) fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a command line does not name a known command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command '{0}'")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}
