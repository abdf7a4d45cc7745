//! Best-effort relay of bot messages to the webhook.
//!
//! Each message is delivered by a detached task: the receive loop returns as
//! soon as the task is spawned. A semaphore bounds how many requests are on the
//! wire at once; tasks waiting for a permit queue without blocking anyone.
//! Failures are counted and logged, never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::{augment, BotId, ForwardError, RelayError, SharedSecret};
use relay_telemetry::{names, MetricsRecorder};
use reqwest::Url;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::config::RelayConfig;
use crate::report;

/// Header carrying the resolved bot identifier.
pub const BOT_ID_HEADER: &str = "X-Bot-Id";
/// Header carrying the shared secret for backend-side authentication.
pub const BRIDGE_TOKEN_HEADER: &str = "X-WS-Bridge-Token";

/// One outbound webhook call.
#[derive(Clone, Debug)]
pub struct CallbackRequest {
    pub bot_id: BotId,
    pub body: Value,
}

impl CallbackRequest {
    pub fn new(bot_id: BotId, message: Map<String, Value>) -> Self {
        let body = augment(&bot_id, message);
        Self { bot_id, body }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    endpoint: Url,
    secret: Option<SharedSecret>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    metrics: Arc<MetricsRecorder>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("endpoint", &self.endpoint.as_str())
            .field("in_flight", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    pub fn new(config: &RelayConfig, metrics: Arc<MetricsRecorder>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.forward_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.webhook_url.clone(),
            secret: config.auth.shared_secret().cloned(),
            permits: Arc::new(Semaphore::new(config.max_in_flight_forwards)),
            tasks: TaskTracker::new(),
            metrics,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Relay `message` for `bot_id` in the background.
    pub fn forward(&self, bot_id: BotId, message: Map<String, Value>) {
        let request = CallbackRequest::new(bot_id, message);
        self.metrics.counter_inc(names::FORWARD_DISPATCHED_TOTAL, &[], 1);

        let this = self.clone();
        let _ = self.tasks.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it were.
            let Ok(_permit) = this.permits.acquire().await else {
                return;
            };
            this.metrics.gauge_inc(names::FORWARD_IN_FLIGHT, &[], 1.0);
            let started = Instant::now();
            let outcome = this.deliver(&request).await;
            this.metrics.gauge_inc(names::FORWARD_IN_FLIGHT, &[], -1.0);
            this.metrics.histogram_observe(
                names::FORWARD_DURATION_SECONDS,
                &[],
                started.elapsed().as_secs_f64(),
            );

            match outcome {
                Ok(status) => {
                    this.metrics.counter_inc(names::FORWARD_DELIVERED_TOTAL, &[], 1);
                    debug!(bot_id = %request.bot_id, status, "forwarded to webhook");
                }
                Err(e) => report::relay_error(
                    &this.metrics,
                    None,
                    Some(&request.bot_id),
                    &RelayError::ForwardFailure(e),
                ),
            }
        });
    }

    /// Perform one webhook call and classify the outcome. Any 2xx is success.
    pub async fn deliver(&self, request: &CallbackRequest) -> Result<u16, ForwardError> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(BOT_ID_HEADER, request.bot_id.as_str())
            .json(&request.body);
        if let Some(secret) = &self.secret {
            builder = builder.header(BRIDGE_TOKEN_HEADER, secret.expose());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ForwardError::from_status(status.as_u16(), body))
        }
    }

    /// Number of forward tasks not yet finished.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait up to `timeout` for every spawned forward to finish.
    ///
    /// Returns false if some were still running when the timeout elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let drained = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        self.tasks.reopen();
        drained
    }
}
