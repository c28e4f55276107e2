//! WebSocket control plane
//!
//! Clients speak a JSON command protocol over `/ws`:
//! `publish`/`unpublish` manage the connection's stream, `play`/`unplay`
//! its subscription. Responses carry `code` 0 (success) or 1 (failure).
//! Disconnects tear down whatever the connection still owns.

use crate::state::SharedState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use rtcast_router::{ConnId, MediaRouter, RouterError, RouterResult, StreamId, SubscriberId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub(crate) struct ClientMessage {
    pub cmd: String,
    #[serde(rename = "streamId", default)]
    pub stream_id: String,
    #[serde(default)]
    pub sdp: String,
    #[serde(rename = "subscriberId", default)]
    pub subscriber_id: String,
}

#[derive(Debug, Serialize, Default)]
pub(crate) struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(rename = "streamId", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(rename = "subscriberId", skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WsResponse {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl WsResponse {
    pub(crate) fn ok(data: ResponseData) -> Self {
        Self {
            code: 0,
            data: Some(data),
        }
    }

    pub(crate) fn ok_empty() -> Self {
        Self {
            code: 0,
            data: None,
        }
    }

    pub(crate) fn fail() -> Self {
        Self {
            code: 1,
            data: None,
        }
    }
}

pub async fn ws_handler(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: SharedState, socket: WebSocket) {
    let conn = state.registry.register_connection();
    debug!(%conn, "websocket connected");
    let (mut sender, mut receiver) = socket.split();

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let response = handle_message(&state, conn, text.as_str()).await;
                match serde_json::to_string(&response) {
                    Ok(encoded) => {
                        if sender.send(Message::Text(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%conn, error = %err, "response encoding failed"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    on_disconnect(&state, conn).await;
    debug!(%conn, "websocket disconnected");
}

pub(crate) async fn handle_message(state: &SharedState, conn: ConnId, raw: &str) -> WsResponse {
    let message: ClientMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(%conn, error = %err, "malformed control message");
            return WsResponse::fail();
        }
    };
    debug!(%conn, cmd = %message.cmd, stream = %message.stream_id, "control message");

    match message.cmd.as_str() {
        "publish" => handle_publish(state, conn, &message).await,
        "unpublish" => handle_unpublish(state, conn, &message).await,
        "play" => handle_play(state, conn, &message).await,
        "unplay" => handle_unplay(state, conn, &message).await,
        other => {
            warn!(%conn, cmd = %other, "unknown command");
            WsResponse::fail()
        }
    }
}

async fn handle_publish(state: &SharedState, conn: ConnId, message: &ClientMessage) -> WsResponse {
    let stream_id = StreamId::from(message.stream_id.as_str());
    if state.registry.router(&stream_id).is_some() {
        warn!(stream = %stream_id, "publish rejected: stream already live");
        return WsResponse::fail();
    }

    let router = MediaRouter::new(
        stream_id.clone(),
        Arc::clone(&state.endpoint),
        state.capabilities.clone(),
        true,
    );
    let publisher = match router.create_publisher(&message.sdp).await {
        Ok(publisher) => publisher,
        Err(err) => {
            warn!(stream = %stream_id, error = %err, "publish negotiation failed");
            return WsResponse::fail();
        }
    };
    if let Err(err) = state.registry.add_router(Arc::clone(&router)) {
        // Lost a race against a concurrent publish for the same id.
        warn!(stream = %stream_id, error = %err, "publish rejected");
        router.stop().await;
        return WsResponse::fail();
    }

    state.registry.update_connection(conn, |session| {
        session.stream_id = Some(stream_id.clone());
    });
    info!(stream = %stream_id, %conn, "stream published");

    WsResponse::ok(ResponseData {
        sdp: publisher.answer().map(str::to_string),
        stream_id: Some(message.stream_id.clone()),
        ..Default::default()
    })
}

async fn handle_unpublish(
    state: &SharedState,
    conn: ConnId,
    message: &ClientMessage,
) -> WsResponse {
    let stream_id = StreamId::from(message.stream_id.as_str());
    let Some(router) = state.registry.remove_router(&stream_id) else {
        return WsResponse::fail();
    };
    router.stop().await;
    state.registry.update_connection(conn, |session| {
        session.stream_id = None;
    });
    info!(stream = %stream_id, %conn, "stream unpublished");
    WsResponse::ok_empty()
}

async fn handle_play(state: &SharedState, conn: ConnId, message: &ClientMessage) -> WsResponse {
    let stream_id = StreamId::from(message.stream_id.as_str());
    let router = match lookup_or_pull(state, &stream_id).await {
        Ok(router) => router,
        Err(RouterError::StreamNotFound(_)) => {
            debug!(stream = %stream_id, "play: stream not found");
            return WsResponse::fail();
        }
        Err(err) => {
            warn!(stream = %stream_id, error = %err, "play failed");
            return WsResponse::fail();
        }
    };

    let subscriber = match router.create_subscriber(&message.sdp).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            warn!(stream = %stream_id, error = %err, "subscribe negotiation failed");
            return WsResponse::fail();
        }
    };

    state.registry.update_connection(conn, |session| {
        session.stream_id = Some(stream_id.clone());
        session.subscriber_id = Some(subscriber.id().clone());
    });
    info!(stream = %stream_id, subscriber = %subscriber.id(), %conn, "subscriber playing");

    WsResponse::ok(ResponseData {
        sdp: Some(subscriber.answer().to_string()),
        stream_id: Some(message.stream_id.clone()),
        subscriber_id: Some(subscriber.id().to_string()),
    })
}

async fn handle_unplay(state: &SharedState, conn: ConnId, message: &ClientMessage) -> WsResponse {
    let stream_id = StreamId::from(message.stream_id.as_str());
    let Some(router) = state.registry.router(&stream_id) else {
        return WsResponse::fail();
    };

    let subscriber_id = SubscriberId::from(message.subscriber_id.as_str());
    if let Some(remaining) = router.stop_subscriber(&subscriber_id).await {
        state
            .relay
            .release_if_idle(&state.registry, &router, remaining)
            .await;
    }
    state.registry.update_connection(conn, |session| {
        session.stream_id = None;
        session.subscriber_id = None;
    });
    WsResponse::ok_empty()
}

/// Find the local router for `stream_id`, or pull it from the cluster when
/// relay origins are configured.
async fn lookup_or_pull(
    state: &SharedState,
    stream_id: &StreamId,
) -> RouterResult<Arc<MediaRouter>> {
    if let Some(router) = state.registry.router(stream_id) {
        return Ok(router);
    }
    if !state.relay.has_origins() {
        return Err(RouterError::StreamNotFound(stream_id.clone()));
    }

    let router = state
        .relay
        .pull(stream_id, Arc::clone(&state.endpoint), &state.capabilities)
        .await?;
    match state.registry.add_router(Arc::clone(&router)) {
        Ok(()) => Ok(router),
        Err(RouterError::RouterExists(_)) => {
            // Lost a pull race; release our pull and use the winner.
            if let (Some(origin), Some(publisher)) = (router.origin_url(), router.publisher()) {
                let origin_subscriber = publisher.id().to_string();
                state
                    .relay
                    .unpull(&origin, stream_id, &origin_subscriber)
                    .await;
            }
            router.stop().await;
            state
                .registry
                .router(stream_id)
                .ok_or_else(|| RouterError::StreamNotFound(stream_id.clone()))
        }
        Err(err) => Err(err),
    }
}

/// Cleanup-on-disconnect: a publisher connection takes its whole router
/// down, a viewer connection only its subscriber (with relay teardown when
/// it was the last one).
pub(crate) async fn on_disconnect(state: &SharedState, conn: ConnId) {
    let Some(session) = state.registry.remove_connection(conn) else {
        return;
    };
    let Some(stream_id) = session.stream_id else {
        return;
    };

    match session.subscriber_id {
        None => {
            if let Some(router) = state.registry.remove_router(&stream_id) {
                info!(stream = %stream_id, %conn, "publisher disconnected; stopping stream");
                router.stop().await;
            }
        }
        Some(subscriber_id) => {
            if let Some(router) = state.registry.router(&stream_id) {
                if let Some(remaining) = router.stop_subscriber(&subscriber_id).await {
                    state
                        .relay
                        .release_if_idle(&state.registry, &router, remaining)
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use rtcast_router::testing::{sdp, MockEndpoint};
    use rtcast_router::MediaCapabilities;

    fn test_state() -> (SharedState, Arc<MockEndpoint>) {
        let endpoint = Arc::new(MockEndpoint::new());
        let state = AppState::new(
            Arc::clone(&endpoint) as Arc<dyn rtcast_router::Endpoint>,
            MediaCapabilities::browser_defaults(),
            Vec::new(),
        );
        (state, endpoint)
    }

    fn publish_msg(stream: &str) -> String {
        serde_json::json!({ "cmd": "publish", "streamId": stream, "sdp": sdp(true, true) })
            .to_string()
    }

    #[tokio::test]
    async fn test_publish_play_unplay_round_trip() {
        let (state, _endpoint) = test_state();
        let publisher_conn = state.registry.register_connection();
        let viewer_conn = state.registry.register_connection();

        let response = handle_message(&state, publisher_conn, &publish_msg("s1")).await;
        assert_eq!(response.code, 0);
        assert!(response.data.unwrap().sdp.is_some());
        assert_eq!(state.registry.router_count(), 1);

        let play = serde_json::json!({ "cmd": "play", "streamId": "s1", "sdp": sdp(true, true) })
            .to_string();
        let response = handle_message(&state, viewer_conn, &play).await;
        assert_eq!(response.code, 0);
        let data = response.data.unwrap();
        let subscriber_id = data.subscriber_id.unwrap();

        let router = state.registry.router(&StreamId::from("s1")).unwrap();
        assert_eq!(router.subscriber_count(), 1);

        let unplay = serde_json::json!({
            "cmd": "unplay", "streamId": "s1", "subscriberId": subscriber_id
        })
        .to_string();
        let response = handle_message(&state, viewer_conn, &unplay).await;
        assert_eq!(response.code, 0);
        assert_eq!(router.subscriber_count(), 0);
        // Origin router survives its last viewer.
        assert_eq!(state.registry.router_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_publish_fails() {
        let (state, _endpoint) = test_state();
        let conn = state.registry.register_connection();

        assert_eq!(handle_message(&state, conn, &publish_msg("s1")).await.code, 0);
        assert_eq!(handle_message(&state, conn, &publish_msg("s1")).await.code, 1);
        assert_eq!(state.registry.router_count(), 1);
    }

    #[tokio::test]
    async fn test_play_unknown_stream_without_relay_is_not_found() {
        let (state, _endpoint) = test_state();
        let conn = state.registry.register_connection();

        let play = serde_json::json!({ "cmd": "play", "streamId": "s2", "sdp": sdp(true, true) })
            .to_string();
        let response = handle_message(&state, conn, &play).await;
        assert_eq!(response.code, 1);
        assert_eq!(state.registry.router_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_fails_without_panic() {
        let (state, _endpoint) = test_state();
        let conn = state.registry.register_connection();
        assert_eq!(handle_message(&state, conn, "{not json").await.code, 1);
        assert_eq!(
            handle_message(&state, conn, r#"{"cmd":"warp"}"#).await.code,
            1
        );
    }

    #[tokio::test]
    async fn test_publisher_disconnect_stops_stream() {
        let (state, _endpoint) = test_state();
        let publisher_conn = state.registry.register_connection();
        let viewer_conn = state.registry.register_connection();

        handle_message(&state, publisher_conn, &publish_msg("s1")).await;
        let play = serde_json::json!({ "cmd": "play", "streamId": "s1", "sdp": sdp(true, true) })
            .to_string();
        handle_message(&state, viewer_conn, &play).await;

        let router = state.registry.router(&StreamId::from("s1")).unwrap();
        on_disconnect(&state, publisher_conn).await;

        assert_eq!(state.registry.router_count(), 0);
        assert!(router.is_stopped());
        assert_eq!(router.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_viewer_disconnect_only_drops_subscriber() {
        let (state, _endpoint) = test_state();
        let publisher_conn = state.registry.register_connection();
        let viewer_conn = state.registry.register_connection();

        handle_message(&state, publisher_conn, &publish_msg("s1")).await;
        let play = serde_json::json!({ "cmd": "play", "streamId": "s1", "sdp": sdp(true, true) })
            .to_string();
        handle_message(&state, viewer_conn, &play).await;

        on_disconnect(&state, viewer_conn).await;

        let router = state.registry.router(&StreamId::from("s1")).unwrap();
        assert!(!router.is_stopped());
        assert_eq!(router.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unpublish_round_trip() {
        let (state, _endpoint) = test_state();
        let conn = state.registry.register_connection();
        handle_message(&state, conn, &publish_msg("s1")).await;

        let unpublish =
            serde_json::json!({ "cmd": "unpublish", "streamId": "s1" }).to_string();
        assert_eq!(handle_message(&state, conn, &unpublish).await.code, 0);
        assert_eq!(state.registry.router_count(), 0);

        // Unpublishing a gone stream reports failure, as the protocol does.
        assert_eq!(handle_message(&state, conn, &unpublish).await.code, 1);
    }
}
