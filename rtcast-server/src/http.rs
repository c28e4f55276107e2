//! Edge-to-edge HTTP endpoints
//!
//! `/pull` negotiates a relay subscriber on a locally hosted stream;
//! `/unpull` releases it. Status codes follow the relay protocol: 10000
//! success, 10001 bad request, 10002 stream not found.

use crate::state::SharedState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use rtcast_router::relay::{RELAY_STATUS_BAD_REQUEST, RELAY_STATUS_NOT_FOUND, RELAY_STATUS_OK};
use rtcast_router::{StreamId, SubscriberId};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub(crate) struct PullBody {
    #[serde(rename = "streamId")]
    stream_id: String,
    sdp: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UnpullBody {
    #[serde(rename = "streamId")]
    stream_id: String,
    #[serde(rename = "subscriberId")]
    subscriber_id: String,
}

pub async fn pull_stream(
    State(state): State<SharedState>,
    body: Result<Json<PullBody>, JsonRejection>,
) -> Json<Value> {
    let Ok(Json(body)) = body else {
        return Json(json!({ "s": RELAY_STATUS_BAD_REQUEST, "e": "malformed request" }));
    };

    let stream_id = StreamId::from(body.stream_id.as_str());
    let Some(router) = state.registry.router(&stream_id) else {
        return Json(json!({ "s": RELAY_STATUS_NOT_FOUND, "e": "can not find stream" }));
    };

    match router.create_subscriber(&body.sdp).await {
        Ok(subscriber) => {
            debug!(stream = %stream_id, subscriber = %subscriber.id(), "relay pull served");
            Json(json!({
                "s": RELAY_STATUS_OK,
                "d": {
                    "sdp": subscriber.answer(),
                    "subscriberId": subscriber.id().to_string(),
                }
            }))
        }
        Err(err) => {
            warn!(stream = %stream_id, error = %err, "relay pull negotiation failed");
            Json(json!({ "s": RELAY_STATUS_BAD_REQUEST, "e": err.to_string() }))
        }
    }
}

pub async fn unpull_stream(
    State(state): State<SharedState>,
    body: Result<Json<UnpullBody>, JsonRejection>,
) -> Json<Value> {
    let Ok(Json(body)) = body else {
        return Json(json!({ "s": RELAY_STATUS_BAD_REQUEST, "e": "malformed request" }));
    };

    // Teardown is idempotent: unknown stream or subscriber ids are no-ops.
    let stream_id = StreamId::from(body.stream_id.as_str());
    if let Some(router) = state.registry.router(&stream_id) {
        let subscriber_id = SubscriberId::from(body.subscriber_id.as_str());
        if let Some(remaining) = router.stop_subscriber(&subscriber_id).await {
            state
                .relay
                .release_if_idle(&state.registry, &router, remaining)
                .await;
        }
    }
    Json(json!({ "s": RELAY_STATUS_OK }))
}
