//! Static relay bootstrap
//!
//! Each `relay: { type: static }` config entry materializes a remote source
//! as a local origin stream at startup, backed by an ffmpeg publisher. The
//! decode process's completion signal drives teardown, so a dead source
//! does not leave a zombie router registered.

use crate::state::SharedState;
use rtcast_router::{MediaRouter, StreamId};
use std::sync::Arc;
use tracing::{info, warn};

/// Spawn one supervisor task per static relay entry.
pub fn start_static_relays(state: &SharedState, relays: Vec<(String, String)>) {
    for (stream, url) in relays {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            run_static_relay(state, stream, url).await;
        });
    }
}

async fn run_static_relay(state: SharedState, stream: String, url: String) {
    let stream_id = StreamId::from(stream.as_str());
    let router = MediaRouter::new(
        stream_id.clone(),
        Arc::clone(&state.endpoint),
        state.capabilities.clone(),
        true,
    );

    let done = match router.create_ffmpeg_publisher(&url).await {
        Ok((_, done)) => done,
        Err(err) => {
            warn!(stream = %stream_id, %url, error = %err, "static relay failed to start");
            return;
        }
    };
    if let Err(err) = state.registry.add_router(Arc::clone(&router)) {
        warn!(stream = %stream_id, error = %err, "static relay stream id already taken");
        router.stop().await;
        return;
    }
    info!(stream = %stream_id, %url, "static relay started");

    match done.await {
        Ok(Ok(())) => info!(stream = %stream_id, "static relay source ended"),
        Ok(Err(err)) => warn!(stream = %stream_id, error = %err, "static relay source failed"),
        Err(_) => warn!(stream = %stream_id, "static relay monitor dropped"),
    }

    state.registry.remove_router(&stream_id);
    router.stop().await;
}
