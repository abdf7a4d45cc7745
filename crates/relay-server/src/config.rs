use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use relay_core::AuthMode;
use reqwest::Url;

/// What to do when a connection's bot identifier is already registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Close the newcomer; the existing session keeps its entry.
    #[default]
    RejectNew,
    /// Close and evict the existing session, then register the newcomer.
    ReplaceExisting,
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject-new" | "reject_new" => Ok(Self::RejectNew),
            "replace-existing" | "replace_existing" => Ok(Self::ReplaceExisting),
            other => Err(ConfigError::InvalidConflictPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RejectNew => f.write_str("reject-new"),
            Self::ReplaceExisting => f.write_str("replace-existing"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("AUTH_TOKEN is not set (set it to an empty string to accept unauthenticated connections)")]
    MissingAuthToken,
    #[error("WEBHOOK_URL is not set")]
    MissingWebhookUrl,
    #[error("invalid webhook URL '{url}': {reason}")]
    InvalidWebhookUrl { url: String, reason: String },
    #[error("unknown conflict policy '{0}' (expected 'reject-new' or 'replace-existing')")]
    InvalidConflictPolicy(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Relay server configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub auth: AuthMode,
    pub webhook_url: Url,
    pub liveness_interval: Duration,
    pub forward_timeout: Duration,
    pub max_in_flight_forwards: usize,
    pub conflict_policy: ConflictPolicy,
}

impl RelayConfig {
    /// Config with the given auth mode and webhook and defaults for everything else.
    pub fn new(auth: AuthMode, webhook_url: Url) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            auth,
            webhook_url,
            liveness_interval: Duration::from_secs(60),
            forward_timeout: Duration::from_secs(30),
            max_in_flight_forwards: 256,
            conflict_policy: ConflictPolicy::RejectNew,
        }
    }

    /// Validate the two settings that have no safe default.
    ///
    /// An absent auth token is an error; an empty one selects permissive mode.
    pub fn from_required(
        auth_token: Option<&str>,
        webhook_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let auth = auth_token
            .map(AuthMode::from_configured)
            .ok_or(ConfigError::MissingAuthToken)?;
        let webhook_url = parse_webhook_url(webhook_url.ok_or(ConfigError::MissingWebhookUrl)?)?;
        Ok(Self::new(auth, webhook_url))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_interval.is_zero() {
            return Err(ConfigError::Zero("liveness interval"));
        }
        if self.forward_timeout.is_zero() {
            return Err(ConfigError::Zero("forward timeout"));
        }
        if self.max_in_flight_forwards == 0 {
            return Err(ConfigError::Zero("max in-flight forwards"));
        }
        Ok(())
    }
}

fn parse_webhook_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidWebhookUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::from_required(Some("secret"), Some("https://example.com/hook")).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.liveness_interval, Duration::from_secs(60));
        assert_eq!(config.forward_timeout, Duration::from_secs(30));
        assert_eq!(config.max_in_flight_forwards, 256);
        assert_eq!(config.conflict_policy, ConflictPolicy::RejectNew);
        assert!(!config.auth.is_permissive());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_auth_token_is_an_error() {
        let err = RelayConfig::from_required(None, Some("https://example.com")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAuthToken));
    }

    #[test]
    fn empty_auth_token_is_permissive() {
        let config = RelayConfig::from_required(Some(""), Some("http://localhost:3000/api")).unwrap();
        assert!(config.auth.is_permissive());
    }

    #[test]
    fn missing_webhook_is_an_error() {
        let err = RelayConfig::from_required(Some("s"), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWebhookUrl));
    }

    #[test]
    fn webhook_must_be_http() {
        let err = RelayConfig::from_required(Some("s"), Some("ftp://example.com")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWebhookUrl { .. }));
        let err = RelayConfig::from_required(Some("s"), Some("not a url")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWebhookUrl { .. }));
    }

    #[test]
    fn zero_values_rejected() {
        let mut config = RelayConfig::from_required(Some("s"), Some("http://h/x")).unwrap();
        config.max_in_flight_forwards = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
        config.max_in_flight_forwards = 1;
        config.forward_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn conflict_policy_parsing() {
        assert_eq!("reject-new".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::RejectNew);
        assert_eq!(
            "Replace-Existing".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::ReplaceExisting
        );
        assert!("merge".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::ReplaceExisting.to_string(), "replace-existing");
    }
}
