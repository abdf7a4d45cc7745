//! Per-connection lifecycle: admission, the sequential receive loop, and teardown.

use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use relay_core::{
    parse_message, resolve_from_message, summarize, BotId, ConnectParams, ConnectionId, RegistryKey, RelayError,
    POLICY_VIOLATION_CLOSE_CODE,
};
use relay_telemetry::names;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConflictPolicy;
use crate::registry::{ConnectionRecord, RegistryError};
use crate::report;
use crate::server::RelayState;
use crate::transport::{Outbound, TransportHandle};

/// Close code for a session displaced by, or rejected because of, another
/// session with the same bot identifier.
pub const DUPLICATE_SESSION_CLOSE_CODE: u16 = 4409;
const DUPLICATE_REASON: &str = "duplicate bot session";
const SUPERSEDED_REASON: &str = "superseded by newer session";

const OUTBOUND_QUEUE: usize = 32;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Drive one upgraded websocket from authentication to close.
pub async fn handle_socket(socket: WebSocket, params: ConnectParams, state: RelayState) {
    let connection_id = ConnectionId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(err) = state.authenticator.check(params.token.as_deref()) {
        report::relay_error(&state.metrics, Some(&connection_id), None, &err);
        let frame = CloseFrame {
            code: POLICY_VIOLATION_CLOSE_CODE,
            reason: "Invalid token".into(),
        };
        if let Err(e) = ws_tx.send(WsMessage::Close(Some(frame))).await {
            debug!(connection_id = %connection_id, error = %e, "failed to send policy close");
        }
        return;
    }

    let (handle, outbound_rx) = TransportHandle::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, connection_id.clone()));

    let provisional = relay_core::resolve_provisional(&params);
    let Some(mut session) = Session::admit(&state, connection_id, provisional, handle.clone()) else {
        drop(handle);
        let _ = writer.await;
        return;
    };
    session.greet();

    let mut peer_close = None;
    loop {
        tokio::select! {
            biased;
            () = handle.closed() => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => session.process(&state, text.as_str()),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => session.process(&state, text),
                    Err(e) => session.reject(&state, &RelayError::malformed(format!("binary frame is not UTF-8: {e}"))),
                },
                // keep reading so the close reply is flushed before the stream ends
                Some(Ok(WsMessage::Close(frame))) => peer_close = frame,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if peer_close.is_none() {
                        warn!(connection_id = %session.connection_id, bot_id = session.bot_label(), error = %e, "websocket error");
                    }
                    break;
                }
                None => break,
            },
        }
    }

    session.finish(&state, peer_close.as_ref());
    drop(session);
    drop(handle);
    let _ = writer.await;
}

/// Drain queued frames onto the socket and keep it warm with pings.
async fn write_loop<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Outbound>, connection_id: ConnectionId)
where
    S: Sink<WsMessage> + Unpin,
{
    let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Outbound::Text(text)) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                    break;
                }
                tracing::trace!(connection_id = %connection_id, "sent ping");
            }
        }
    }
}

/// Receive-side state of one admitted connection.
pub(crate) struct Session {
    connection_id: ConnectionId,
    key: RegistryKey,
    bot_id: Option<BotId>,
    handle: TransportHandle,
    started: Instant,
}

impl Session {
    /// Register the connection, applying the conflict policy when its
    /// connect-time identifier is already live. Returns `None` if rejected.
    pub(crate) fn admit(
        state: &RelayState,
        connection_id: ConnectionId,
        provisional: Option<BotId>,
        handle: TransportHandle,
    ) -> Option<Self> {
        let key = match &provisional {
            Some(bot_id) => RegistryKey::Resolved(bot_id.clone()),
            None => RegistryKey::Provisional(connection_id.clone()),
        };

        let inserted = with_conflict_policy(state, &key, || {
            state.registry.insert(
                key.clone(),
                ConnectionRecord::new(connection_id.clone(), handle.clone()),
            )
        });
        if let Err(err) = inserted {
            reject_duplicate(state, &connection_id, provisional.as_ref(), &handle, &err);
            return None;
        }

        state.metrics.counter_inc(names::WS_CONNECTIONS_TOTAL, &[], 1);
        state.metrics.gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], 1.0);
        info!(
            connection_id = %connection_id,
            bot_id = provisional.as_ref().map_or("not provided - will extract from messages", BotId::as_str),
            "connection authenticated"
        );

        Some(Self {
            connection_id,
            key,
            bot_id: provisional,
            handle,
            started: Instant::now(),
        })
    }

    fn bot_label(&self) -> &str {
        self.bot_id.as_ref().map_or("unknown", BotId::as_str)
    }

    pub(crate) fn greet(&self) {
        let greeting = json!({
            "type": "connected",
            "botId": self.bot_id,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        if !self.handle.send_text(greeting.to_string()) {
            debug!(connection_id = %self.connection_id, "greeting not queued");
        }
    }

    /// Handle one inbound frame: parse, resolve identity, count, relay.
    pub(crate) fn process(&mut self, state: &RelayState, raw: &str) {
        let message = match parse_message(raw) {
            Ok(message) => message,
            Err(err) => {
                self.reject(state, &err);
                return;
            }
        };
        debug!(connection_id = %self.connection_id, bot_id = self.bot_label(), raw = %raw, "raw message received");

        if self.bot_id.is_none() {
            if let Some(candidate) = resolve_from_message(&message) {
                self.promote(state, candidate);
            }
        }

        let _ = state
            .registry
            .touch(&self.key, &self.connection_id, ConnectionRecord::record_message);
        state.metrics.counter_inc(names::MESSAGES_RECEIVED_TOTAL, &[], 1);

        let summary = summarize(&message);
        info!(
            bot_id = self.bot_label(),
            kind = summary.kind.as_deref().unwrap_or("unknown"),
            has_words = summary.has_words,
            words_count = summary.words_count,
            "message received"
        );

        match &self.bot_id {
            Some(bot_id) => state.forwarder.forward(bot_id.clone(), message),
            None => report::relay_error(
                &state.metrics,
                Some(&self.connection_id),
                None,
                &RelayError::UnresolvedIdentifier,
            ),
        }
    }

    /// Report a frame that could not be used. The connection stays open.
    pub(crate) fn reject(&self, state: &RelayState, err: &RelayError) {
        report::relay_error(&state.metrics, Some(&self.connection_id), self.bot_id.as_ref(), err);
    }

    /// Rebind from the provisional key to the identifier found in a message.
    fn promote(&mut self, state: &RelayState, candidate: BotId) {
        let target = RegistryKey::Resolved(candidate.clone());
        let rebound = with_conflict_policy(state, &target, || {
            state.registry.rebind(&self.key, target.clone())
        });
        match rebound {
            Ok(_) => {
                info!(connection_id = %self.connection_id, bot_id = %candidate, "bot id extracted from message");
                self.key = target;
                self.bot_id = Some(candidate);
            }
            Err(err @ RegistryError::KeyConflict { .. }) => {
                reject_duplicate(state, &self.connection_id, Some(&candidate), &self.handle, &err);
            }
            Err(err) => {
                warn!(connection_id = %self.connection_id, error = %err, "rebind failed");
            }
        }
    }

    /// Remove the record and log how the connection ended.
    pub(crate) fn finish(&self, state: &RelayState, peer_close: Option<&CloseFrame>) {
        let removed = state.registry.remove(&self.key, &self.connection_id);
        state.metrics.gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], -1.0);

        let code = peer_close.map_or(close_code::ABNORMAL, |frame| frame.code);
        let reason = peer_close.map_or("", |frame| frame.reason.as_str());
        match removed {
            Some(snapshot) => info!(
                connection_id = %self.connection_id,
                bot_id = self.bot_label(),
                code,
                reason,
                messages_received = snapshot.messages_received,
                duration_secs = snapshot.age.as_secs(),
                "connection closed"
            ),
            None => info!(
                connection_id = %self.connection_id,
                bot_id = self.bot_label(),
                code,
                reason,
                duration_secs = self.started.elapsed().as_secs(),
                "connection closed after being superseded"
            ),
        }
    }
}

/// Run `attempt`; under [`ConflictPolicy::ReplaceExisting`] a key conflict
/// evicts and closes the current holder of `key` and the attempt is retried once.
fn with_conflict_policy<T>(
    state: &RelayState,
    key: &RegistryKey,
    mut attempt: impl FnMut() -> Result<T, RegistryError>,
) -> Result<T, RegistryError> {
    match attempt() {
        Err(RegistryError::KeyConflict { .. })
            if state.conflict_policy == ConflictPolicy::ReplaceExisting =>
        {
            if let Some(previous) = state.registry.evict(key) {
                info!(
                    key = %key,
                    previous = %previous.connection_id(),
                    "replacing existing session"
                );
                previous.close(DUPLICATE_SESSION_CLOSE_CODE, SUPERSEDED_REASON);
            }
            attempt()
        }
        other => other,
    }
}

fn reject_duplicate(
    state: &RelayState,
    connection_id: &ConnectionId,
    bot_id: Option<&BotId>,
    handle: &TransportHandle,
    err: &RegistryError,
) {
    report::relay_error(
        &state.metrics,
        Some(connection_id),
        bot_id,
        &RelayError::KeyConflict {
            key: err.to_string(),
        },
    );
    handle.close(DUPLICATE_SESSION_CLOSE_CODE, DUPLICATE_REASON);
}
