//! Cluster relay client: makes streams hosted on other edges playable here.
//!
//! Pull: POST the local receive-only offer to each configured origin in
//! order; the first origin that returns a usable answer backs a new
//! non-origin router. Unpull: best-effort notification releasing the
//! origin's subscriber when the last local viewer detaches.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::Endpoint;
use crate::error::{RouterError, RouterResult};
use crate::registry::SessionRegistry;
use crate::router::MediaRouter;
use crate::types::StreamId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Edge-to-edge protocol status codes.
pub const RELAY_STATUS_OK: i64 = 10000;
pub const RELAY_STATUS_BAD_REQUEST: i64 = 10001;
pub const RELAY_STATUS_NOT_FOUND: i64 = 10002;

const PULL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct PullRequest<'a> {
    #[serde(rename = "streamId")]
    stream_id: &'a str,
    sdp: &'a str,
}

#[derive(Deserialize, Default)]
struct PullData {
    #[serde(default)]
    sdp: String,
    #[serde(rename = "subscriberId", default)]
    subscriber_id: String,
}

#[derive(Deserialize)]
struct PullResponse {
    s: i64,
    #[serde(default)]
    d: PullData,
}

#[derive(Serialize)]
struct UnpullRequest<'a> {
    #[serde(rename = "streamId")]
    stream_id: &'a str,
    #[serde(rename = "subscriberId")]
    subscriber_id: &'a str,
}

/// Client side of the pull/unpull protocol.
pub struct RelayClient {
    http: reqwest::Client,
    origins: Vec<String>,
}

impl RelayClient {
    #[must_use]
    pub fn new(origins: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PULL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, origins }
    }

    #[must_use]
    pub fn has_origins(&self) -> bool {
        !self.origins.is_empty()
    }

    /// Materialize `stream_id` locally by pulling it from the first origin
    /// that has it. Every per-origin failure is swallowed and the next
    /// candidate tried; exhaustion yields `StreamNotFound`.
    pub async fn pull(
        &self,
        stream_id: &StreamId,
        endpoint: Arc<dyn Endpoint>,
        caps: &MediaCapabilities,
    ) -> RouterResult<Arc<MediaRouter>> {
        for origin in &self.origins {
            match self
                .pull_from_origin(origin, stream_id, Arc::clone(&endpoint), caps)
                .await
            {
                Ok(router) => {
                    info!(stream = %stream_id, origin = %origin, "relay pull succeeded");
                    return Ok(router);
                }
                Err(err) => {
                    warn!(stream = %stream_id, origin = %origin, error = %err, "relay pull failed, trying next origin");
                }
            }
        }
        Err(RouterError::StreamNotFound(stream_id.clone()))
    }

    async fn pull_from_origin(
        &self,
        origin: &str,
        stream_id: &StreamId,
        endpoint: Arc<dyn Endpoint>,
        caps: &MediaCapabilities,
    ) -> RouterResult<Arc<MediaRouter>> {
        let pending = endpoint.create_relay_offer(caps).await?;

        let response = self
            .http
            .post(origin_endpoint(origin, "pull"))
            .json(&PullRequest {
                stream_id: stream_id.as_str(),
                sdp: pending.offer(),
            })
            .send()
            .await?;
        let body: PullResponse = response.json().await?;

        if body.s != RELAY_STATUS_OK {
            return Err(RouterError::Upstream(format!(
                "origin answered status {}",
                body.s
            )));
        }
        if body.d.sdp.is_empty() {
            return Err(RouterError::Upstream("origin answered empty sdp".into()));
        }

        let negotiation = pending.complete(&body.d.sdp).await?;
        let origin_subscriber_id = match body.d.subscriber_id.is_empty() {
            // Older edges omit the id; the relayed stream identity carries it.
            true => negotiation.stream_id.clone(),
            false => body.d.subscriber_id,
        };

        let router = MediaRouter::new(stream_id.clone(), endpoint, caps.clone(), false);
        router.set_origin_url(origin);
        router
            .create_relay_publisher(negotiation, origin_subscriber_id)
            .await?;
        Ok(router)
    }

    /// Notify `origin` that our relay subscriber is gone. Best-effort:
    /// failures are logged, never retried, and never block local teardown.
    pub async fn unpull(&self, origin: &str, stream_id: &StreamId, subscriber_id: &str) {
        let result = self
            .http
            .post(origin_endpoint(origin, "unpull"))
            .json(&UnpullRequest {
                stream_id: stream_id.as_str(),
                subscriber_id,
            })
            .send()
            .await;
        match result {
            Ok(_) => debug!(stream = %stream_id, origin = %origin, "unpull sent"),
            Err(err) => warn!(stream = %stream_id, origin = %origin, error = %err, "unpull failed"),
        }
    }

    /// Relay-teardown coupling: when the last subscriber has detached from
    /// a non-origin router, stop it, deregister it, and send exactly one
    /// upstream unpull carrying the subscriber id the origin issued.
    ///
    /// `remaining` must come from the `stop_subscriber` call that removed
    /// the subscriber, so the zero check is atomic with the removal.
    pub async fn release_if_idle(
        &self,
        registry: &SessionRegistry,
        router: &Arc<MediaRouter>,
        remaining: usize,
    ) {
        if remaining > 0 || router.is_origin() {
            return;
        }
        let Some(origin) = router.origin_url() else {
            warn!(stream = %router.stream_id(), "relay router without origin url");
            return;
        };
        // The publisher id is the origin-issued subscriber id; read it
        // before stop clears the publisher.
        let Some(publisher) = router.publisher() else {
            return;
        };
        let subscriber_id = publisher.id().to_string();

        registry.remove_router(router.stream_id());
        router.stop().await;
        self.unpull(&origin, router.stream_id(), &subscriber_id).await;
    }
}

/// Normalize an origin (`host:port` or full URL) into its endpoint URL.
fn origin_endpoint(origin: &str, path: &str) -> String {
    let base = match origin.starts_with("http") {
        true => origin.trim_end_matches('/').to_string(),
        false => format!("http://{}", origin.trim_end_matches('/')),
    };
    format!("{base}/{path}")
}
