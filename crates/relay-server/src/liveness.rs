//! Periodic summary of the live connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::registry::{ConnectionRegistry, ConnectionSnapshot};

/// One line of a liveness report.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessEntry {
    /// Bot identifier, or the provisional key for unidentified connections.
    pub label: String,
    pub messages_received: u64,
    pub uptime_secs: u64,
}

impl From<&ConnectionSnapshot> for LivenessEntry {
    fn from(snapshot: &ConnectionSnapshot) -> Self {
        Self {
            label: snapshot.key.to_string(),
            messages_received: snapshot.messages_received,
            uptime_secs: snapshot.age.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessReport {
    pub entries: Vec<LivenessEntry>,
}

impl LivenessReport {
    /// Build a report from the registry. `None` when there is nothing to report.
    pub fn collect(registry: &ConnectionRegistry) -> Option<Self> {
        let snapshot = registry.snapshot();
        if snapshot.is_empty() {
            return None;
        }
        Some(Self {
            entries: snapshot.iter().map(LivenessEntry::from).collect(),
        })
    }

    pub fn log(&self) {
        info!(active = self.entries.len(), "active connections");
        for entry in &self.entries {
            info!(
                bot_id = %entry.label,
                messages = entry.messages_received,
                uptime_secs = entry.uptime_secs,
                "connection alive"
            );
        }
    }
}

/// Log a liveness report every `interval` until `cancel` fires.
///
/// The task resolves to the number of reports it logged.
pub fn spawn_reporter(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut reports = 0;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(report) = LivenessReport::collect(&registry) {
                        report.log();
                        reports += 1;
                    }
                }
            }
        }
        tracing::debug!(reports, "liveness reporter stopped");
        reports
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{BotId, ConnectionId, RegistryKey};

    use crate::registry::ConnectionRecord;
    use crate::transport::TransportHandle;

    fn admit(registry: &ConnectionRegistry, key: RegistryKey, conn: ConnectionId) {
        let (handle, _rx) = TransportHandle::channel(4);
        registry.insert(key, ConnectionRecord::new(conn, handle)).unwrap();
    }

    #[test]
    fn empty_registry_reports_nothing() {
        let registry = ConnectionRegistry::new();
        assert!(LivenessReport::collect(&registry).is_none());
    }

    #[test]
    fn report_lists_resolved_and_provisional_connections() {
        let registry = ConnectionRegistry::new();
        let bot = BotId::parse("bot-1").unwrap();
        let conn = ConnectionId::new();
        admit(&registry, RegistryKey::Resolved(bot.clone()), conn.clone());
        let pending = ConnectionId::new();
        admit(&registry, RegistryKey::Provisional(pending.clone()), pending.clone());

        for _ in 0..3 {
            registry.touch(&RegistryKey::Resolved(bot.clone()), &conn, ConnectionRecord::record_message);
        }

        let report = LivenessReport::collect(&registry).unwrap();
        assert_eq!(report.entries.len(), 2);
        let resolved = report.entries.iter().find(|e| e.label == "bot-1").unwrap();
        assert_eq!(resolved.messages_received, 3);
        let provisional = report
            .entries
            .iter()
            .find(|e| e.label == format!("pending:{pending}"))
            .unwrap();
        assert_eq!(provisional.messages_received, 0);
    }

    #[test]
    fn collecting_does_not_mutate_registry() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        admit(&registry, RegistryKey::Provisional(conn.clone()), conn);
        let _ = LivenessReport::collect(&registry);
        let after = registry.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].messages_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_cancel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let task = spawn_reporter(registry, Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        // empty registry: ticks fire but nothing is reported
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_reports_each_tick_with_live_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = ConnectionId::new();
        admit(&registry, RegistryKey::Provisional(conn.clone()), conn);
        let cancel = CancellationToken::new();
        let task = spawn_reporter(Arc::clone(&registry), Duration::from_secs(60), cancel.clone());

        // nothing at start-up, then one report per elapsed interval
        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_secs(100)).await;

        cancel.cancel();
        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(registry.len(), 1);
    }
}
