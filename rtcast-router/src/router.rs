//! MediaRouter: per-stream aggregate binding one publisher to many
//! subscribers.
//!
//! Lifecycle: `Created → PublisherBound → Active → Stopped`, with `Stopped`
//! terminal. All map/pointer mutations happen under one short-lived lock
//! that is never held across an await; negotiation runs before taking it,
//! resource teardown after releasing it.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::{Endpoint, IngressNegotiation};
use crate::error::{RouterError, RouterResult};
use crate::publisher::{
    FfPublisher, Publisher, RtcPublisher, RelayPublisher, RtmpCodecData, RtmpPublisher,
};
use crate::subscriber::Subscriber;
use crate::types::{StreamId, SubscriberId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Default)]
struct RouterState {
    publisher: Option<Arc<Publisher>>,
    subscribers: HashMap<SubscriberId, Arc<Subscriber>>,
    stopped: bool,
}

pub struct MediaRouter {
    stream_id: StreamId,
    endpoint: Arc<dyn Endpoint>,
    capabilities: MediaCapabilities,
    /// True when the publisher is locally produced; false for relay-backed
    /// routers.
    origin: bool,
    origin_url: Mutex<Option<String>>,
    state: Mutex<RouterState>,
}

impl std::fmt::Debug for MediaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaRouter")
            .field("stream_id", &self.stream_id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl MediaRouter {
    /// Allocate a new router. Callers must consult the registry first; this
    /// constructor does not deduplicate stream ids.
    pub fn new(
        stream_id: StreamId,
        endpoint: Arc<dyn Endpoint>,
        capabilities: MediaCapabilities,
        origin: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            endpoint,
            capabilities,
            origin,
            origin_url: Mutex::new(None),
            state: Mutex::new(RouterState::default()),
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    #[must_use]
    pub const fn is_origin(&self) -> bool {
        self.origin
    }

    #[must_use]
    pub fn capabilities(&self) -> &MediaCapabilities {
        &self.capabilities
    }

    /// Upstream edge this router relays from; set once at relay creation.
    #[must_use]
    pub fn origin_url(&self) -> Option<String> {
        self.origin_url.lock().clone()
    }

    pub fn set_origin_url(&self, url: impl Into<String>) {
        *self.origin_url.lock() = Some(url.into());
    }

    #[must_use]
    pub fn publisher(&self) -> Option<Arc<Publisher>> {
        self.state.lock().publisher.clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.state.lock().subscribers.keys().cloned().collect()
    }

    #[must_use]
    pub fn subscriber(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.state.lock().subscribers.get(id).cloned()
    }

    /// Negotiate and bind a WebRTC publisher. Fails with `PublisherExists`
    /// when a live publisher is already bound (republish requires an
    /// explicit unpublish) and leaves the router unmodified on negotiation
    /// failure.
    pub async fn create_publisher(&self, offer: &str) -> RouterResult<Arc<Publisher>> {
        self.check_can_bind()?;
        let publisher =
            RtcPublisher::negotiate(self.endpoint.as_ref(), offer, &self.capabilities).await?;
        self.bind(Arc::new(Publisher::Rtc(publisher))).await
    }

    /// Bind a relay publisher from a completed pull negotiation.
    /// `origin_subscriber_id` is the id the origin edge allocated for us.
    pub async fn create_relay_publisher(
        &self,
        negotiation: IngressNegotiation,
        origin_subscriber_id: impl Into<String>,
    ) -> RouterResult<Arc<Publisher>> {
        let publisher = RelayPublisher::from_negotiation(negotiation, origin_subscriber_id.into());
        self.bind(Arc::new(Publisher::Relay(publisher))).await
    }

    /// Bind an RTMP publisher for the declared codecs. Media flows only
    /// once the caller starts the publisher's pump against its source.
    pub async fn create_rtmp_publisher(
        &self,
        codec_data: &[RtmpCodecData],
    ) -> RouterResult<Arc<Publisher>> {
        self.check_can_bind()?;
        let publisher =
            RtmpPublisher::new(self.stream_id.as_str(), codec_data, &self.capabilities).await?;
        self.bind(Arc::new(Publisher::Rtmp(publisher))).await
    }

    /// Bind an ffmpeg publisher pulling `url`. The returned channel fires
    /// when the decode process exits; the caller must stop the router then.
    pub async fn create_ffmpeg_publisher(
        &self,
        url: &str,
    ) -> RouterResult<(Arc<Publisher>, oneshot::Receiver<RouterResult<()>>)> {
        self.check_can_bind()?;
        let (publisher, done) =
            FfPublisher::spawn(self.stream_id.as_str(), url, &self.capabilities).await?;
        let publisher = self.bind(Arc::new(Publisher::Ffmpeg(publisher))).await?;
        Ok((publisher, done))
    }

    /// Negotiate, attach and register a new subscriber. Requires a bound
    /// publisher.
    pub async fn create_subscriber(&self, offer: &str) -> RouterResult<Arc<Subscriber>> {
        let publisher = {
            let state = self.state.lock();
            if state.stopped {
                return Err(RouterError::RouterStopped(self.stream_id.clone()));
            }
            state
                .publisher
                .clone()
                .ok_or_else(|| RouterError::NoPublisher(self.stream_id.clone()))?
        };

        let subscriber = Subscriber::negotiate(
            self.endpoint.as_ref(),
            offer,
            &self.capabilities,
            publisher.kinds(),
            self.stream_id.clone(),
        )
        .await?;
        subscriber.attach(&publisher);
        let subscriber = Arc::new(subscriber);

        // The router may have been stopped while we negotiated; re-check
        // under the same lock that inserts.
        let inserted = {
            let mut state = self.state.lock();
            if state.stopped {
                false
            } else {
                state
                    .subscribers
                    .insert(subscriber.id().clone(), Arc::clone(&subscriber));
                true
            }
        };
        if !inserted {
            subscriber.stop().await;
            return Err(RouterError::RouterStopped(self.stream_id.clone()));
        }

        debug!(
            stream = %self.stream_id,
            subscriber = %subscriber.id(),
            total = self.subscriber_count(),
            "subscriber created"
        );
        Ok(subscriber)
    }

    /// Stop and remove one subscriber. Unknown ids are a no-op (`None`).
    /// On removal, returns the number of subscribers remaining, computed
    /// atomically with the removal so last-subscriber decisions cannot race
    /// a concurrent `create_subscriber`.
    pub async fn stop_subscriber(&self, id: &SubscriberId) -> Option<usize> {
        let (subscriber, remaining) = {
            let mut state = self.state.lock();
            let subscriber = state.subscribers.remove(id);
            (subscriber, state.subscribers.len())
        };
        let subscriber = subscriber?;
        subscriber.stop().await;
        debug!(stream = %self.stream_id, subscriber = %id, remaining, "subscriber stopped");
        Some(remaining)
    }

    /// Tear down the publisher and every subscriber, leaving the router in
    /// its terminal state. Idempotent and safe against concurrent
    /// create/stop calls.
    pub async fn stop(&self) {
        let (publisher, subscribers) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let subscribers: Vec<_> = state.subscribers.drain().map(|(_, s)| s).collect();
            (state.publisher.take(), subscribers)
        };

        if let Some(publisher) = publisher {
            publisher.stop().await;
        }
        let subscriber_count = subscribers.len();
        for subscriber in subscribers {
            subscriber.stop().await;
        }
        info!(stream = %self.stream_id, subscribers = subscriber_count, "router stopped");
    }

    fn check_can_bind(&self) -> RouterResult<()> {
        let state = self.state.lock();
        if state.stopped {
            return Err(RouterError::RouterStopped(self.stream_id.clone()));
        }
        if state.publisher.is_some() {
            return Err(RouterError::PublisherExists(self.stream_id.clone()));
        }
        Ok(())
    }

    /// Bind a freshly negotiated publisher, re-checking the guards under
    /// the lock. The loser of a bind race is stopped before the error is
    /// returned, so no transport leaks.
    async fn bind(&self, publisher: Arc<Publisher>) -> RouterResult<Arc<Publisher>> {
        let conflict = {
            let mut state = self.state.lock();
            if state.stopped {
                Some(RouterError::RouterStopped(self.stream_id.clone()))
            } else if state.publisher.is_some() {
                Some(RouterError::PublisherExists(self.stream_id.clone()))
            } else {
                state.publisher = Some(Arc::clone(&publisher));
                None
            }
        };

        match conflict {
            Some(err) => {
                publisher.stop().await;
                Err(err)
            }
            None => {
                debug!(stream = %self.stream_id, publisher = publisher.id(), "publisher bound");
                Ok(publisher)
            }
        }
    }
}
