//! Registry of live connections keyed by bot identity.
//!
//! A single `RwLock` guards the whole map, so every operation is linearizable
//! with respect to every other and a rebind is observed either before or after,
//! never half-done. The lock is never held across an await point.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relay_core::{BotId, ConnectionId, RegistryKey};

use crate::transport::TransportHandle;

/// State of one live streaming session.
#[derive(Debug)]
pub struct ConnectionRecord {
    connection_id: ConnectionId,
    bot_id: Option<BotId>,
    transport: TransportHandle,
    connected_at: DateTime<Utc>,
    started: Instant,
    messages_received: u64,
}

impl ConnectionRecord {
    /// New, unidentified record. The identifier is taken from the key on insert.
    pub fn new(connection_id: ConnectionId, transport: TransportHandle) -> Self {
        Self {
            connection_id,
            bot_id: None,
            transport,
            connected_at: Utc::now(),
            started: Instant::now(),
            messages_received: 0,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn bot_id(&self) -> Option<&BotId> {
        self.bot_id.as_ref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_message(&mut self) {
        self.messages_received = self.messages_received.saturating_add(1);
    }

    /// Close the underlying transport.
    pub fn close(&self, code: u16, reason: &str) {
        self.transport.close(code, reason);
    }

    fn snapshot(&self, key: &RegistryKey) -> ConnectionSnapshot {
        ConnectionSnapshot {
            key: key.clone(),
            connection_id: self.connection_id.clone(),
            bot_id: self.bot_id.clone(),
            connected_at: self.connected_at,
            age: self.age(),
            messages_received: self.messages_received,
        }
    }
}

/// Point-in-time copy of a record, safe to hold outside the lock.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionSnapshot {
    pub key: RegistryKey,
    pub connection_id: ConnectionId,
    pub bot_id: Option<BotId>,
    pub connected_at: DateTime<Utc>,
    pub age: Duration,
    pub messages_received: u64,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry key {key} is already held by another connection")]
    KeyConflict { key: RegistryKey },
    #[error("no connection registered under {key}")]
    NotFound { key: RegistryKey },
    #[error("connection under {key} is already identified as {bot_id}")]
    AlreadyResolved { key: RegistryKey, bot_id: BotId },
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<RegistryKey, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `record` under `key`. Never overwrites an existing entry.
    pub fn insert(&self, key: RegistryKey, mut record: ConnectionRecord) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::KeyConflict { key });
        }
        record.bot_id = key.bot_id().cloned();
        let _ = entries.insert(key, record);
        Ok(())
    }

    /// Move the record at `old` to `new`, keeping its counters and timestamps.
    ///
    /// Rebinding to the same key is a no-op. A target held by another record is
    /// rejected with [`RegistryError::KeyConflict`], and an identified record
    /// can only be rebound to its own identifier.
    pub fn rebind(&self, old: &RegistryKey, new: RegistryKey) -> Result<ConnectionSnapshot, RegistryError> {
        let mut entries = self.entries.write();

        let Some(current) = entries.get(old) else {
            return Err(RegistryError::NotFound { key: old.clone() });
        };
        if *old == new {
            return Ok(current.snapshot(old));
        }
        if let Some(bot_id) = &current.bot_id {
            if new.bot_id() != Some(bot_id) {
                return Err(RegistryError::AlreadyResolved {
                    key: old.clone(),
                    bot_id: bot_id.clone(),
                });
            }
        }
        if entries.contains_key(&new) {
            return Err(RegistryError::KeyConflict { key: new });
        }

        let Some(mut record) = entries.remove(old) else {
            return Err(RegistryError::NotFound { key: old.clone() });
        };
        if let Some(bot_id) = new.bot_id() {
            record.bot_id = Some(bot_id.clone());
        }
        let snapshot = record.snapshot(&new);
        let _ = entries.insert(new, record);
        Ok(snapshot)
    }

    pub fn lookup(&self, key: &RegistryKey) -> Option<ConnectionSnapshot> {
        self.entries.read().get(key).map(|record| record.snapshot(key))
    }

    /// Apply `f` to the record at `key` if it belongs to `owner`.
    ///
    /// Returns false (and does nothing) when the key is absent or held by
    /// another connection.
    pub fn touch(
        &self,
        key: &RegistryKey,
        owner: &ConnectionId,
        f: impl FnOnce(&mut ConnectionRecord),
    ) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(record) if record.connection_id == *owner => {
                f(record);
                true
            }
            _ => false,
        }
    }

    /// Remove the record at `key` if it belongs to `owner`.
    pub fn remove(&self, key: &RegistryKey, owner: &ConnectionId) -> Option<ConnectionSnapshot> {
        let mut entries = self.entries.write();
        if entries.get(key)?.connection_id != *owner {
            return None;
        }
        entries.remove(key).map(|record| record.snapshot(key))
    }

    /// Remove whatever record is at `key`, regardless of owner.
    ///
    /// Used to displace an older session; the caller is responsible for
    /// closing the returned record's transport.
    pub fn evict(&self, key: &RegistryKey) -> Option<ConnectionRecord> {
        self.entries.write().remove(key)
    }

    /// Close every registered transport. Records stay until their receive loops remove them.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let entries = self.entries.read();
        for record in entries.values() {
            record.close(code, reason);
        }
        entries.len()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut all: Vec<ConnectionSnapshot> = self
            .entries
            .read()
            .iter()
            .map(|(key, record)| record.snapshot(key))
            .collect();
        all.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
