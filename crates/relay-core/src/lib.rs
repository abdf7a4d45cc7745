//! Shared building blocks for the bot relay: identifiers, the error taxonomy,
//! connection authentication, and the inspection of inbound bot messages.

pub mod auth;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod message;

pub use auth::{AuthDecision, AuthMode, Authenticator, SharedSecret, POLICY_VIOLATION_CLOSE_CODE};
pub use errors::{ForwardError, RelayError};
pub use identity::{resolve_from_message, resolve_provisional, ConnectParams};
pub use ids::{BotId, ConnectionId, RegistryKey};
pub use message::{augment, parse_message, summarize, MessageSummary};
