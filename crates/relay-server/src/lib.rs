//! Websocket relay between meeting bots and a webhook backend.
//!
//! Each bot connection is authenticated, registered under its bot id (or a
//! provisional key until the id shows up in a message), and every message it
//! sends is forwarded to the webhook on a detached task.

pub mod config;
pub mod connection;
pub mod forwarder;
pub mod liveness;
pub mod registry;
mod report;
pub mod server;
pub mod transport;

pub use config::{ConfigError, ConflictPolicy, RelayConfig};
pub use connection::DUPLICATE_SESSION_CLOSE_CODE;
pub use forwarder::Forwarder;
pub use liveness::{LivenessEntry, LivenessReport};
pub use registry::{ConnectionRecord, ConnectionRegistry, ConnectionSnapshot, RegistryError};
pub use server::{build_router, start, RelayState, ServerHandle, StartError, GOING_AWAY_CLOSE_CODE};
pub use transport::{Outbound, TransportHandle};
