use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_server::{ConflictPolicy, RelayConfig};
use relay_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tracing::Level;

/// Relay meeting-bot websocket streams to a webhook.
#[derive(Debug, Parser)]
#[command(name = "bot-relay", version)]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Shared secret bots must present. Falls back to AUTH_TOKEN; an empty
    /// value accepts every connection.
    #[arg(long)]
    auth_token: Option<String>,

    /// Webhook every message is forwarded to.
    #[arg(long, env = "WEBHOOK_URL")]
    webhook_url: Option<String>,

    #[arg(long, env = "LIVENESS_INTERVAL_SECS", default_value_t = 60)]
    liveness_interval_secs: u64,

    #[arg(long, env = "FORWARD_TIMEOUT_SECS", default_value_t = 30)]
    forward_timeout_secs: u64,

    /// Upper bound on concurrent webhook requests.
    #[arg(long, env = "MAX_IN_FLIGHT_FORWARDS", default_value_t = 256)]
    max_in_flight_forwards: usize,

    /// `reject-new` or `replace-existing`.
    #[arg(long, env = "CONFLICT_POLICY", default_value_t = ConflictPolicy::RejectNew)]
    conflict_policy: ConflictPolicy,

    #[arg(long, env = "LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    /// `pretty` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    fn relay_config(self) -> anyhow::Result<RelayConfig> {
        // clap drops empty env values, and an empty token is meaningful here
        let auth_token = self
            .auth_token
            .or_else(|| std::env::var("AUTH_TOKEN").ok());
        let mut config =
            RelayConfig::from_required(auth_token.as_deref(), self.webhook_url.as_deref())?;
        config.host = self.host;
        config.port = self.port;
        config.liveness_interval = Duration::from_secs(self.liveness_interval_secs);
        config.forward_timeout = Duration::from_secs(self.forward_timeout_secs);
        config.max_in_flight_forwards = self.max_in_flight_forwards;
        config.conflict_policy = self.conflict_policy;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let telemetry = init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..TelemetryConfig::default()
    });
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let config = cli.relay_config().context("invalid configuration")?;
    if config.auth.is_permissive() {
        tracing::warn!("AUTH_TOKEN is empty: accepting connections without a token");
    }

    let handle = relay_server::start(config, telemetry.metrics())
        .await
        .context("failed to start relay server")?;
    tracing::info!(port = handle.port(), "bot relay ready");

    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_defaults() {
        let cli = Cli::try_parse_from([
            "bot-relay",
            "--auth-token",
            "secret",
            "--webhook-url",
            "https://backend.example.com/hook",
            "--port",
            "4000",
            "--conflict-policy",
            "replace-existing",
            "--max-in-flight-forwards",
            "8",
        ])
        .unwrap();
        let config = cli.relay_config().unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.conflict_policy, ConflictPolicy::ReplaceExisting);
        assert_eq!(config.max_in_flight_forwards, 8);
        assert!(!config.auth.is_permissive());
    }

    #[test]
    fn empty_auth_token_is_permissive() {
        let cli = Cli::try_parse_from([
            "bot-relay",
            "--auth-token",
            "",
            "--webhook-url",
            "http://localhost:8080/hook",
        ])
        .unwrap();
        assert!(cli.relay_config().unwrap().auth.is_permissive());
    }

    #[test]
    fn zero_timeout_rejected() {
        let cli = Cli::try_parse_from([
            "bot-relay",
            "--auth-token",
            "secret",
            "--webhook-url",
            "http://localhost:8080/hook",
            "--forward-timeout-secs",
            "0",
        ])
        .unwrap();
        assert!(cli.relay_config().is_err());
    }
}
