//! RTMP ingest
//!
//! The protocol work (handshake, chunking, AMF) is the `rtmp` crate's; this
//! module runs its server against a stream hub and bridges every published
//! stream into the router: a publish broadcast event creates an origin
//! router backed by an `RtmpPublisher`, a hub frame subscription feeds it,
//! and the pump's completion signal drives teardown.

pub mod flv;

use crate::error::{ServerError, ServerResult};
use crate::state::SharedState;
use flv::FlvFrameSource;
use rtcast_router::publisher::RtmpSource;
use rtcast_router::{MediaRouter, StreamId};
use rtmp::rtmp::RtmpServer;
use std::sync::Arc;
use std::time::Duration;
use streamhub::define::{
    BroadcastEvent, NotifyInfo, StreamHubEvent, StreamHubEventSender, SubDataType, SubscribeType,
    SubscriberInfo,
};
use streamhub::stream::StreamIdentifier;
use streamhub::utils::{RandomDigitCount, Uuid};
use streamhub::StreamsHub;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

/// How long a connection may take to send its codec headers.
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the RTMP ingest listener on `port`. Never returns under normal
/// operation.
pub async fn run(state: SharedState, port: u16) -> ServerResult<()> {
    let mut hub = StreamsHub::new(None);
    let event_sender = hub.get_hub_event_sender();
    let mut client_events = hub.get_client_event_consumer();
    tokio::spawn(async move {
        hub.run().await;
    });

    let address = format!("0.0.0.0:{port}");
    info!(%address, "rtmp ingest listening");
    let mut server = RtmpServer::new(address, event_sender.clone(), 1, None);
    tokio::spawn(async move {
        if let Err(err) = server.run().await {
            error!(error = %err, "rtmp server stopped");
        }
    });

    loop {
        match client_events.recv().await {
            Ok(BroadcastEvent::Publish { identifier, .. }) => {
                let state = Arc::clone(&state);
                let sender = event_sender.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_publish(state, sender, identifier.clone()).await {
                        warn!(?identifier, error = %err, "rtmp publish handling failed");
                    }
                });
            }
            Ok(BroadcastEvent::UnPublish { identifier, .. }) => {
                // The frame channel closing already ends the pump; this is
                // the fast path for explicit unpublish.
                if let StreamIdentifier::Rtmp { stream_name, .. } = identifier {
                    let stream_id = StreamId::from(stream_name.as_str());
                    if let Some(router) = state.registry.remove_router(&stream_id) {
                        router.stop().await;
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "rtmp broadcast events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(ServerError::Rtmp("stream hub event bus closed".into()));
            }
        }
    }
}

/// Bridge one published RTMP stream into a router and pump it until the
/// connection ends, then tear the router down.
async fn handle_publish(
    state: SharedState,
    event_sender: StreamHubEventSender,
    identifier: StreamIdentifier,
) -> ServerResult<()> {
    let StreamIdentifier::Rtmp {
        app_name,
        stream_name,
    } = identifier.clone()
    else {
        return Ok(());
    };
    info!(app = %app_name, stream = %stream_name, "rtmp stream published");

    let subscriber_info = SubscriberInfo {
        id: Uuid::new(RandomDigitCount::Four),
        sub_type: SubscribeType::RtmpPull,
        sub_data_type: SubDataType::Frame,
        notify_info: NotifyInfo {
            request_url: String::new(),
            remote_addr: String::new(),
        },
    };

    let (result_sender, result_receiver) = oneshot::channel();
    event_sender
        .send(StreamHubEvent::Subscribe {
            identifier: identifier.clone(),
            info: subscriber_info.clone(),
            result_sender,
        })
        .map_err(|_| ServerError::Rtmp("stream hub rejected subscribe".into()))?;
    let receiver = result_receiver
        .await
        .map_err(|err| ServerError::Rtmp(format!("subscribe result dropped: {err}")))?
        .map_err(|err| ServerError::Rtmp(format!("subscribe failed: {err:?}")))?;
    let frames = receiver
        .0
        .frame_receiver
        .ok_or_else(|| ServerError::Rtmp("stream hub returned no frame receiver".into()))?;

    let source = FlvFrameSource::negotiate(frames, HEADER_TIMEOUT).await?;

    let stream_id = StreamId::from(stream_name.as_str());
    let router = MediaRouter::new(
        stream_id.clone(),
        Arc::clone(&state.endpoint),
        state.capabilities.clone(),
        true,
    );
    let publisher = router.create_rtmp_publisher(source.codec_data()).await?;
    if let Err(err) = state.registry.add_router(Arc::clone(&router)) {
        router.stop().await;
        return Err(err.into());
    }

    let done = publisher
        .as_rtmp()
        .map(|p| p.start(Box::new(source)))
        .ok_or_else(|| ServerError::Rtmp("router bound a non-rtmp publisher".into()))?;

    // The pump runs until the connection errs out or closes; stopping the
    // router and deregistering is this task's responsibility.
    let result = done.await;
    match result {
        Ok(Ok(())) => info!(stream = %stream_id, "rtmp stream ended"),
        Ok(Err(err)) => warn!(stream = %stream_id, error = %err, "rtmp stream failed"),
        Err(_) => warn!(stream = %stream_id, "rtmp pump dropped"),
    }

    state.registry.remove_router(&stream_id);
    router.stop().await;

    let unsubscribe = StreamHubEvent::UnSubscribe {
        identifier,
        info: subscriber_info,
    };
    if event_sender.send(unsubscribe).is_err() {
        warn!(stream = %stream_id, "stream hub unsubscribe failed");
    }
    Ok(())
}
