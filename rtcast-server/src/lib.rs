//! rtcast edge server
//!
//! Control plane and ingest surfaces around the rtcast media router:
//!
//! - WebSocket `/ws`: publish/unpublish/play/unplay for clients
//! - HTTP `/pull`, `/unpull`: the edge-to-edge relay protocol
//! - RTMP ingest: push publishing bridged through the stream hub
//! - Static relays: configured remote sources pulled at startup

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod relays;
pub mod rtmp;
pub mod state;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use state::SharedState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the HTTP/WebSocket application router.
pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/pull", post(http::pull_stream))
        .route("/unpull", post(http::unpull_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
