/// Longest webhook response body kept in a [`ForwardError`].
const MAX_BODY_CHARS: usize = 512;

/// Conditions raised while admitting connections and relaying their messages.
///
/// Only [`RelayError::AuthDenied`] ends a connection; everything else is
/// reported and the receive loop carries on.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication denied")]
    AuthDenied,
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },
    #[error("registry key {key} is held by another connection")]
    KeyConflict { key: String },
    #[error("forward failed: {0}")]
    ForwardFailure(#[from] ForwardError),
    #[error("bot identifier not yet resolved, message not forwarded")]
    UnresolvedIdentifier,
}

impl RelayError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::AuthDenied)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthDenied => "auth_denied",
            Self::MalformedMessage { .. } => "malformed_message",
            Self::KeyConflict { .. } => "key_conflict",
            Self::ForwardFailure(_) => "forward_failure",
            Self::UnresolvedIdentifier => "unresolved_identifier",
        }
    }
}

/// Failure to deliver one message to the webhook. Never retried.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("webhook responded {status}: {body}")]
    Status { status: u16, body: String },
    #[error("webhook transport error: {0}")]
    Transport(String),
}

impl ForwardError {
    /// Build the error for a non-2xx response, truncating the body.
    pub fn from_status(status: u16, body: String) -> Self {
        let body = if body.chars().count() > MAX_BODY_CHARS {
            let mut cut: String = body.chars().take(MAX_BODY_CHARS).collect();
            cut.push('…');
            cut
        } else {
            body
        };
        Self::Status { status, body }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { status: 500..=599, .. } => "server_error",
            Self::Status { status: 400..=499, .. } => "client_error",
            Self::Status { .. } => "unexpected_status",
            Self::Transport(_) => "transport",
        }
    }
}
