use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one meeting-bot streaming session, as reported by upstream.
///
/// Never empty: construction goes through [`BotId::parse`].
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(String);

impl BotId {
    /// Returns `None` for the empty string, which never counts as an identity.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Server-assigned identity of one accepted transport connection.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which a connection is registered.
///
/// Provisional keys are derived from the connection itself, so they live in a
/// separate variant and can never collide with a resolved bot identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum RegistryKey {
    Resolved(BotId),
    Provisional(ConnectionId),
}

impl RegistryKey {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn bot_id(&self) -> Option<&BotId> {
        match self {
            Self::Resolved(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }
}

impl From<BotId> for RegistryKey {
    fn from(id: BotId) -> Self {
        Self::Resolved(id)
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(id) => write!(f, "{id}"),
            Self::Provisional(conn) => write!(f, "pending:{conn}"),
        }
    }
}
