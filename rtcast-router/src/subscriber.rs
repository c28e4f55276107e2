//! Subscriber: one viewer's egress side of a stream.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::{Endpoint, MediaTransport, TrackFeed, TrackSink};
use crate::error::RouterResult;
use crate::publisher::Publisher;
use crate::types::{StreamId, SubscriberId, TrackKind, TrackKinds};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interval of the per-subscriber ICE statistics poll.
const ICE_STATS_INTERVAL: Duration = Duration::from_secs(5);

/// One egress connection: an outbound transport with up to one track per
/// media kind, fed from the owning router's publisher.
pub struct Subscriber {
    id: SubscriberId,
    stream_id: StreamId,
    answer: String,
    audio: Option<Arc<dyn TrackSink>>,
    video: Option<Arc<dyn TrackSink>>,
    transport: Arc<dyn MediaTransport>,
    cancel: CancellationToken,
    attached: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Negotiate a new egress transport for `offer`, carrying tracks only
    /// for `kinds` (the kinds the publisher exposes). Starts the ICE
    /// statistics poller; `stop` cancels it.
    pub async fn negotiate(
        endpoint: &dyn Endpoint,
        offer: &str,
        caps: &MediaCapabilities,
        kinds: TrackKinds,
        stream_id: StreamId,
    ) -> RouterResult<Self> {
        let id = SubscriberId::random();
        let egress = endpoint
            .negotiate_egress(offer, caps, kinds, id.as_str())
            .await?;

        let subscriber = Self {
            id,
            stream_id,
            answer: egress.answer,
            audio: egress.audio,
            video: egress.video,
            transport: egress.transport,
            cancel: CancellationToken::new(),
            attached: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };
        subscriber.spawn_ice_stats_poll();
        Ok(subscriber)
    }

    #[must_use]
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Stream this subscriber belongs to (informational).
    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    #[must_use]
    pub fn answer(&self) -> &str {
        &self.answer
    }

    #[must_use]
    pub fn sink(&self, kind: TrackKind) -> Option<&Arc<dyn TrackSink>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Bind this subscriber's tracks to the publisher's feeds. Runs at most
    /// once; a media kind missing on either side is skipped (an audio-only
    /// viewer of an A/V stream is a valid degenerate state).
    pub fn attach(&self, publisher: &Publisher) {
        if self.attached.swap(true, Ordering::SeqCst) {
            warn!(subscriber = %self.id, "attach called twice; ignoring");
            return;
        }
        for kind in [TrackKind::Audio, TrackKind::Video] {
            match (publisher.track(kind), self.sink(kind)) {
                (Some(feed), Some(sink)) => self.spawn_forward(feed, Arc::clone(sink)),
                _ => debug!(subscriber = %self.id, %kind, "kind not attached"),
            }
        }
    }

    /// Forward task: one publisher feed into one subscriber sink, until the
    /// subscriber stops or the feed closes.
    fn spawn_forward(&self, feed: &TrackFeed, sink: Arc<dyn TrackSink>) {
        let mut rx = feed.subscribe();
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        let kind = feed.kind();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(packet) => {
                            if let Err(err) = sink.write(packet).await {
                                debug!(subscriber = %id, %kind, error = %err, "egress write failed");
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(subscriber = %id, %kind, skipped, "subscriber lagging; packets dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(subscriber = %id, %kind, "forward task stopped");
        });
    }

    /// Periodic ICE statistics poll for observability; cancelled by `stop`.
    fn spawn_ice_stats_poll(&self) {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ICE_STATS_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            let mut last_requests = 0u64;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = transport.ice_stats().await;
                        debug!(
                            subscriber = %id,
                            requests_received = stats.requests_received,
                            delta = stats.requests_received.saturating_sub(last_requests),
                            bytes_sent = stats.bytes_sent,
                            "ice stats"
                        );
                        last_requests = stats.requests_received;
                    }
                }
            }
        });
    }

    /// Stop the outbound transport and every background task. Idempotent.
    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            self.transport.close().await;
        }
    }
}
