//! Connection admission against the configured shared secret.

use secrecy::{ExposeSecret, SecretString};

use crate::errors::RelayError;

/// Websocket close code sent when a connection presents the wrong token.
pub const POLICY_VIOLATION_CLOSE_CODE: u16 = 1008;

/// Shared secret with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct SharedSecret(SecretString);

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// How inbound connections are admitted.
#[derive(Clone, Debug)]
pub enum AuthMode {
    /// Token must match the secret exactly.
    Required(SharedSecret),
    /// Every connection is admitted. Only reachable from an explicitly empty secret.
    Permissive,
}

impl AuthMode {
    /// Interpret a configured secret: the empty string selects permissive mode.
    pub fn from_configured(secret: &str) -> Self {
        if secret.is_empty() {
            Self::Permissive
        } else {
            Self::Required(SharedSecret::new(secret))
        }
    }

    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        match self {
            Self::Required(secret) => Some(secret),
            Self::Permissive => None,
        }
    }

    pub fn is_permissive(&self) -> bool {
        matches!(self, Self::Permissive)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// Gate applied to every transport connection before it is registered.
#[derive(Clone, Debug)]
pub struct Authenticator {
    mode: AuthMode,
}

impl Authenticator {
    pub fn new(mode: AuthMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    pub fn authenticate(&self, presented: Option<&str>) -> AuthDecision {
        match &self.mode {
            AuthMode::Permissive => AuthDecision::Allow,
            AuthMode::Required(secret) => match presented {
                Some(token) if constant_time_eq(token.as_bytes(), secret.expose().as_bytes()) => {
                    AuthDecision::Allow
                }
                _ => AuthDecision::Deny,
            },
        }
    }

    /// [`Self::authenticate`] as a `Result`, for `?`-style callers.
    pub fn check(&self, presented: Option<&str>) -> Result<(), RelayError> {
        match self.authenticate(presented) {
            AuthDecision::Allow => Ok(()),
            AuthDecision::Deny => Err(RelayError::AuthDenied),
        }
    }
}

/// Constant-time comparison for auth validation.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(secret: &str) -> Authenticator {
        Authenticator::new(AuthMode::from_configured(secret))
    }

    #[test]
    fn matching_token_allowed() {
        assert_eq!(required("secret").authenticate(Some("secret")), AuthDecision::Allow);
    }

    #[test]
    fn mismatched_token_denied() {
        let auth = required("secret");
        assert_eq!(auth.authenticate(Some("secreT")), AuthDecision::Deny);
        assert_eq!(auth.authenticate(Some("secret ")), AuthDecision::Deny);
        assert_eq!(auth.authenticate(Some("")), AuthDecision::Deny);
    }

    #[test]
    fn absent_token_denied() {
        assert_eq!(required("secret").authenticate(None), AuthDecision::Deny);
    }

    #[test]
    fn permissive_mode_allows_everything() {
        let auth = required("");
        assert!(auth.mode().is_permissive());
        assert_eq!(auth.authenticate(None), AuthDecision::Allow);
        assert_eq!(auth.authenticate(Some("anything")), AuthDecision::Allow);
    }

    #[test]
    fn check_maps_deny_to_auth_denied() {
        let auth = required("secret");
        assert!(auth.check(Some("secret")).is_ok());
        assert!(matches!(auth.check(Some("nope")), Err(RelayError::AuthDenied)));
    }

    #[test]
    fn shared_secret_debug_is_redacted() {
        let secret = SharedSecret::new("hunter2");
        let debug = format!("{secret:?} {:?}", AuthMode::Required(secret.clone()));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn shared_secret_only_in_required_mode() {
        assert!(AuthMode::from_configured("s").shared_secret().is_some());
        assert!(AuthMode::Permissive.shared_secret().is_none());
    }

    #[test]
    fn constant_time_eq_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"abc", b"abd"));
    }
}
