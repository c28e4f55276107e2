//! Test support: a scripted [`Endpoint`] with observable transports and
//! sinks.
//!
//! Lives in the crate (not behind `cfg(test)`) so the crate's integration
//! tests and the server crate's handler tests share one implementation.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::{
    media_kinds_from_sdp, require_media, EgressNegotiation, Endpoint, IceStats,
    IngressNegotiation, MediaTransport, PendingRelayIngress, TrackFeed, TrackSink,
};
use crate::error::{RouterError, RouterResult};
use crate::types::{TrackKind, TrackKinds};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Build a minimal offer/answer SDP advertising the given kinds.
#[must_use]
pub fn sdp(audio: bool, video: bool) -> String {
    let mut out = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    if audio {
        out.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:mock a0\r\n");
    }
    if video {
        out.push_str("m=video 9 UDP/TLS/RTP/SAVPF 102\r\na=msid:mock v0\r\n");
    }
    out
}

/// Transport recording how often it was closed.
#[derive(Default)]
pub struct MockTransport {
    closes: AtomicUsize,
}

impl MockTransport {
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn ice_stats(&self) -> IceStats {
        IceStats::default()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink collecting every packet written to it.
pub struct MockSink {
    kind: TrackKind,
    packets: Mutex<Vec<Bytes>>,
}

impl MockSink {
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            packets: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn packets(&self) -> Vec<Bytes> {
        self.packets.lock().clone()
    }
}

#[async_trait]
impl TrackSink for MockSink {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn write(&self, packet: Bytes) -> RouterResult<()> {
        self.packets.lock().push(packet);
        Ok(())
    }
}

/// One recorded egress negotiation.
#[derive(Clone)]
pub struct MockEgress {
    pub stream_id: String,
    pub audio: Option<Arc<MockSink>>,
    pub video: Option<Arc<MockSink>>,
    pub transport: Arc<MockTransport>,
}

#[derive(Default)]
struct MockState {
    fail_next: AtomicBool,
    ingress_transports: Mutex<Vec<Arc<MockTransport>>>,
    egresses: Mutex<Vec<MockEgress>>,
}

/// Scripted endpoint: negotiations are derived from the SDP's `m=` lines,
/// transports and sinks are observable, and the next negotiation can be
/// made to fail.
#[derive(Default)]
pub struct MockEndpoint {
    state: Arc<MockState>,
}

impl MockEndpoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next negotiation fail with `NegotiationFailed`.
    pub fn fail_next(&self) {
        self.state.fail_next.store(true, Ordering::SeqCst);
    }

    /// Transports handed out for ingress negotiations, oldest first.
    #[must_use]
    pub fn ingress_transports(&self) -> Vec<Arc<MockTransport>> {
        self.state.ingress_transports.lock().clone()
    }

    /// Egress negotiations performed, oldest first.
    #[must_use]
    pub fn egresses(&self) -> Vec<MockEgress> {
        self.state.egresses.lock().clone()
    }

    #[must_use]
    pub fn last_egress(&self) -> Option<MockEgress> {
        self.state.egresses.lock().last().cloned()
    }

    fn take_failure(&self) -> RouterResult<()> {
        match self.state.fail_next.swap(false, Ordering::SeqCst) {
            true => Err(RouterError::NegotiationFailed("scripted failure".into())),
            false => Ok(()),
        }
    }

    fn ingress_for_kinds(&self, kinds: TrackKinds, stream_id: &str) -> IngressNegotiation {
        let transport = Arc::new(MockTransport::default());
        self.state
            .ingress_transports
            .lock()
            .push(Arc::clone(&transport));
        IngressNegotiation {
            stream_id: stream_id.to_string(),
            answer: Some(sdp(kinds.audio, kinds.video)),
            audio: kinds.audio.then(|| TrackFeed::new(TrackKind::Audio)),
            video: kinds.video.then(|| TrackFeed::new(TrackKind::Video)),
            transport,
        }
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn negotiate_ingress(
        &self,
        offer: &str,
        caps: &MediaCapabilities,
    ) -> RouterResult<IngressNegotiation> {
        self.take_failure()?;
        let kinds = require_media(offer)?.intersect(caps.kinds());
        Ok(self.ingress_for_kinds(kinds, "mock-ingress"))
    }

    async fn create_relay_offer(
        &self,
        caps: &MediaCapabilities,
    ) -> RouterResult<Box<dyn PendingRelayIngress>> {
        self.take_failure()?;
        let kinds = caps.kinds();
        Ok(Box::new(MockPendingRelay {
            endpoint: MockEndpoint {
                state: Arc::clone(&self.state),
            },
            offer: sdp(kinds.audio, kinds.video),
            kinds,
        }))
    }

    async fn negotiate_egress(
        &self,
        offer: &str,
        caps: &MediaCapabilities,
        kinds: TrackKinds,
        stream_id: &str,
    ) -> RouterResult<EgressNegotiation> {
        self.take_failure()?;
        let kinds = kinds
            .intersect(require_media(offer)?)
            .intersect(caps.kinds());

        let audio = kinds.audio.then(|| Arc::new(MockSink::new(TrackKind::Audio)));
        let video = kinds.video.then(|| Arc::new(MockSink::new(TrackKind::Video)));
        let transport = Arc::new(MockTransport::default());
        self.state.egresses.lock().push(MockEgress {
            stream_id: stream_id.to_string(),
            audio: audio.clone(),
            video: video.clone(),
            transport: Arc::clone(&transport),
        });

        Ok(EgressNegotiation {
            answer: sdp(kinds.audio, kinds.video),
            audio: audio.map(|sink| sink as Arc<dyn TrackSink>),
            video: video.map(|sink| sink as Arc<dyn TrackSink>),
            transport,
        })
    }
}

struct MockPendingRelay {
    endpoint: MockEndpoint,
    offer: String,
    kinds: TrackKinds,
}

#[async_trait]
impl PendingRelayIngress for MockPendingRelay {
    fn offer(&self) -> &str {
        &self.offer
    }

    async fn complete(self: Box<Self>, answer: &str) -> RouterResult<IngressNegotiation> {
        let answered = require_media(answer)?.intersect(self.kinds);
        let stream_id = crate::endpoint::stream_id_from_sdp(answer)
            .unwrap_or_else(|| "mock-relay".to_string());
        Ok(self.endpoint.ingress_for_kinds(answered, &stream_id))
    }
}
