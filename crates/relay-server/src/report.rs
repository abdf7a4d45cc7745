//! Single place where relay errors become log lines and counters.

use relay_core::{BotId, ConnectionId, RelayError};
use relay_telemetry::{names, MetricsRecorder};
use tracing::warn;

pub(crate) fn relay_error(
    metrics: &MetricsRecorder,
    connection_id: Option<&ConnectionId>,
    bot_id: Option<&BotId>,
    error: &RelayError,
) {
    let kind = error.error_kind();
    metrics.counter_inc(names::RELAY_ERRORS_TOTAL, &[("kind", kind)], 1);
    match error {
        RelayError::AuthDenied => metrics.counter_inc(names::WS_AUTH_DENIED_TOTAL, &[], 1),
        RelayError::MalformedMessage { .. } => {
            metrics.counter_inc(names::MESSAGES_MALFORMED_TOTAL, &[], 1);
        }
        RelayError::KeyConflict { .. } => {
            metrics.counter_inc(names::REGISTRY_KEY_CONFLICTS_TOTAL, &[], 1);
        }
        RelayError::ForwardFailure(e) => {
            metrics.counter_inc(names::FORWARD_FAILED_TOTAL, &[("kind", e.kind())], 1);
        }
        RelayError::UnresolvedIdentifier => {
            metrics.counter_inc(names::FORWARD_SKIPPED_UNRESOLVED_TOTAL, &[], 1);
        }
    }

    let connection_id = connection_id.map(ConnectionId::as_str).unwrap_or("-");
    let bot_id = bot_id.map_or("unknown", BotId::as_str);
    warn!(connection_id, bot_id, kind, error = %error, "relay error");
}
