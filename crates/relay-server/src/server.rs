use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay_core::{Authenticator, ConnectParams};
use relay_telemetry::MetricsRecorder;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigError, ConflictPolicy, RelayConfig};
use crate::connection;
use crate::forwarder::Forwarder;
use crate::liveness;
use crate::registry::ConnectionRegistry;

/// Close code sent to every live connection when the server shuts down.
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<Authenticator>,
    pub forwarder: Forwarder,
    pub metrics: Arc<MetricsRecorder>,
    pub conflict_policy: ConflictPolicy,
    pub started_at: Instant,
}

impl RelayState {
    pub fn new(config: &RelayConfig, metrics: Arc<MetricsRecorder>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new()),
            authenticator: Arc::new(Authenticator::new(config.auth.clone())),
            forwarder: Forwarder::new(config, Arc::clone(&metrics))?,
            metrics,
            conflict_policy: config.conflict_policy,
            started_at: Instant::now(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Build the Axum router with all routes.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Validate `config`, bind the listener and start serving.
pub async fn start(
    config: RelayConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, StartError> {
    config.validate()?;
    let state = RelayState::new(&config, metrics)?;

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let liveness = liveness::spawn_reporter(
        Arc::clone(&state.registry),
        config.liveness_interval,
        shutdown.child_token(),
    );

    let router = build_router(state.clone());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
    });

    tracing::info!(
        addr = %local_addr,
        webhook = %state.forwarder.endpoint(),
        permissive = state.authenticator.mode().is_permissive(),
        conflict_policy = %config.conflict_policy,
        "relay server started"
    );

    Ok(ServerHandle {
        local_addr,
        state,
        shutdown,
        drain_timeout: config.forward_timeout,
        server,
        liveness,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: RelayState,
    shutdown: CancellationToken,
    drain_timeout: Duration,
    server: JoinHandle<()>,
    liveness: JoinHandle<u64>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Stop accepting, close live sockets, then give in-flight forwards up
    /// to the forward timeout to finish.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.shutdown.cancel();
        let closed = self
            .state
            .registry
            .close_all(GOING_AWAY_CLOSE_CODE, "server shutting down");
        tracing::debug!(closed, "closed live connections");

        if tokio::time::timeout(self.drain_timeout, self.server).await.is_err() {
            tracing::warn!("server did not stop within the drain timeout");
        }
        if let Ok(reports) = self.liveness.await {
            tracing::debug!(reports, "liveness reporter joined");
        }

        if !self.state.forwarder.drain(self.drain_timeout).await {
            tracing::warn!(
                abandoned = self.state.forwarder.pending(),
                "forwards still in flight at shutdown"
            );
        }
        tracing::info!("shutdown complete");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    tracing::info!(
        peer = %addr,
        bot_id = params.bot_id.as_deref().unwrap_or("not provided"),
        has_token = params.token.is_some(),
        "websocket connection attempt"
    );
    ws.on_upgrade(move |socket| connection::handle_socket(socket, params, state))
}

async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "counters": state.metrics.counters_snapshot(),
        "gauges": state.metrics.gauges_snapshot(),
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use relay_core::{AuthMode, BotId, ConnectionId, RegistryKey};
    use reqwest::Url;
    use tower::ServiceExt;

    use crate::registry::ConnectionRecord;
    use crate::transport::TransportHandle;

    fn state() -> RelayState {
        let config = RelayConfig::new(
            AuthMode::from_configured("secret"),
            Url::parse("http://127.0.0.1:9/hook").unwrap(),
        );
        RelayState::new(&config, Arc::new(MetricsRecorder::new())).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_registry_size() {
        let state = state();
        let (handle, _rx) = TransportHandle::channel(4);
        state
            .registry
            .insert(
                RegistryKey::Resolved(BotId::parse("bot-1").unwrap()),
                ConnectionRecord::new(ConnectionId::new(), handle),
            )
            .unwrap();

        let resp = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
        assert!(body["uptime"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn health_exposes_relay_counters() {
        let state = state();
        crate::report::relay_error(
            &state.metrics,
            None,
            None,
            &relay_core::RelayError::UnresolvedIdentifier,
        );

        let resp = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["counters"]["forward_skipped_unresolved_total"], 1);
        assert_eq!(
            body["counters"]["relay_errors_total{kind=\"unresolved_identifier\"}"],
            1
        );
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let resp = build_router(state())
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Not found");
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut config = RelayConfig::new(
            AuthMode::Permissive,
            Url::parse("http://127.0.0.1:9/hook").unwrap(),
        );
        config.max_in_flight_forwards = 0;
        let err = start(config, Arc::new(MetricsRecorder::new())).await.err().unwrap();
        assert!(matches!(err, StartError::Config(ConfigError::Zero(_))));
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let mut config = RelayConfig::new(
            AuthMode::Permissive,
            Url::parse("http://127.0.0.1:9/hook").unwrap(),
        );
        config.host = "127.0.0.1".into();
        config.port = 0;
        let handle = start(config, Arc::new(MetricsRecorder::new())).await.unwrap();
        assert_ne!(handle.port(), 0);
        assert!(handle.state().registry.is_empty());
        handle.shutdown().await;
    }
}
