//! Outbound lifecycle notifications.
//!
//! The broker describes what happened; delivery is the sink's problem.
//! The bundled [`WebhookSink`] posts events to a single endpoint:
//! lifecycle events are retried with exponential backoff, transient
//! queue chatter is fire-and-forget.
//!
//! `PlaybackReset` is a cross-subsystem side channel: allocating a
//! session clears the room's in-progress playback state, and the
//! playback subsystem learns that here rather than being called
//! directly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::queue::QueueStatus;
use crate::registry::Session;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Allocated { room_id: String, session: Session },
    Released { room_id: String },
    Expired { room_id: String },
    SessionFailed { room_id: String, reason: String },
    Queued { room_id: String, status: QueueStatus },
    QueueCancelled { room_id: String },
    OfferAvailable { room_id: String, status: QueueStatus },
    OfferExpired { room_id: String },
    PlaybackReset { room_id: String },
}

impl SessionEvent {
    pub fn room_id(&self) -> &str {
        match self {
            Self::Allocated { room_id, .. }
            | Self::Released { room_id }
            | Self::Expired { room_id }
            | Self::SessionFailed { room_id, .. }
            | Self::Queued { room_id, .. }
            | Self::QueueCancelled { room_id }
            | Self::OfferAvailable { room_id, .. }
            | Self::OfferExpired { room_id }
            | Self::PlaybackReset { room_id } => room_id,
        }
    }

    /// Stable event name, matching the serialized `event` tag.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allocated { .. } => "allocated",
            Self::Released { .. } => "released",
            Self::Expired { .. } => "expired",
            Self::SessionFailed { .. } => "session_failed",
            Self::Queued { .. } => "queued",
            Self::QueueCancelled { .. } => "queue_cancelled",
            Self::OfferAvailable { .. } => "offer_available",
            Self::OfferExpired { .. } => "offer_expired",
            Self::PlaybackReset { .. } => "playback_reset",
        }
    }

    /// Lifecycle events must land; queue chatter may be dropped.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Allocated { .. }
                | Self::Released { .. }
                | Self::Expired { .. }
                | Self::SessionFailed { .. }
                | Self::OfferAvailable { .. }
                | Self::OfferExpired { .. }
        )
    }
}

/// Notification sink contract.
///
/// `emit` must not block the admission path: implementations queue or
/// spawn their own delivery work.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Sink that drops everything. Useful for embedders that poll status
/// instead of consuming events.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, event: SessionEvent) {
        tracing::debug!(room = %event.room_id(), ?event, "Event discarded (null sink)");
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSinkConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookSinkConfig {
    fn default() -> Self {
        Self {
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Posts events as JSON to a single webhook endpoint.
pub struct WebhookSink {
    url: String,
    config: WebhookSinkConfig,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String, config: WebhookSinkConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Ok(token) = std::env::var("USHER_EVENT_AUTH_TOKEN")
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            url,
            config,
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a lifecycle event, retrying on retryable statuses.
    async fn send_with_retry(
        client: reqwest::Client,
        url: String,
        config: WebhookSinkConfig,
        payload: serde_json::Value,
    ) {
        let mut attempt = 0;
        loop {
            match client.post(&url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(status = %status, "Event webhook delivered");
                        return;
                    }

                    if config.retry_status_codes.contains(&status) {
                        attempt += 1;
                        if attempt > config.max_retries {
                            tracing::error!(
                                status = %status,
                                attempts = attempt,
                                "Event webhook failed after max retries"
                            );
                            return;
                        }

                        let backoff = config.backoff_base * (1 << attempt.min(10));
                        tracing::warn!(
                            status = %status,
                            attempt = attempt,
                            backoff_ms = backoff.as_millis(),
                            "Event webhook failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    tracing::error!(
                        status = %status,
                        "Event webhook failed with non-retryable status"
                    );
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        tracing::error!(
                            error = %e,
                            attempts = attempt,
                            "Event webhook failed after max retries"
                        );
                        return;
                    }

                    let backoff = config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis(),
                        "Event webhook request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

impl EventSink for WebhookSink {
    fn emit(&self, event: SessionEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize event");
                return;
            }
        };

        let client = self.client.clone();
        let url = self.url.clone();

        if event.is_lifecycle() {
            let config = self.config.clone();
            tokio::spawn(Self::send_with_retry(client, url, config, payload));
        } else {
            tokio::spawn(async move {
                if let Err(e) = client.post(&url).json(&payload).send().await {
                    tracing::warn!(error = %e, "Failed to send event webhook (transient)");
                }
            });
        }
    }
}

/// Sink that forwards events onto an unbounded channel; handy for
/// embedders that fan out over their own transport (room broadcast,
/// server-sent events).
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped - discarding event");
        }
    }
}
