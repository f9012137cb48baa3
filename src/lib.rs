pub mod broker;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error_handler;
pub mod events;
pub mod factory;
pub mod frame;
pub mod heartbeat;
pub mod parser;
pub mod relay;
pub mod server;
pub mod session;
pub mod subscription;
pub mod transport;

pub use broker::{Broker, Destination, InMemoryBroker};
pub use codec::{CodecError, StompCodec};
pub use command::{Command, header};
pub use config::RelayConfig;
pub use connection::{Connection, RelayError, SystemConnection};
pub use error_handler::{DefaultErrorHandler, ErrorHandler};
pub use events::{EventBus, EventContext, EventKind};
pub use frame::{Frame, FrameBuilder, FrameError, Headers};
pub use heartbeat::{HeartBeatMonitor, negotiate_heartbeats, parse_heartbeat_header};
pub use relay::{Relay, RelayBuilder};
pub use server::{Server, ServerError, TcpSink};
pub use transport::{ClientSink, CloseReason, TransportError};
