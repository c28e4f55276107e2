//! Media-endpoint boundary
//!
//! The WebRTC engine is an external collaborator: the router only needs the
//! ability to negotiate transports from SDP, fan incoming RTP out to
//! subscribers, and read ICE statistics. That capability is captured by the
//! [`Endpoint`] trait; [`webrtc::WebRtcEndpoint`] is the production
//! implementation and [`crate::testing::MockEndpoint`] the scripted one.

pub mod rtp;
pub mod webrtc;

use crate::capabilities::MediaCapabilities;
use crate::error::{RouterError, RouterResult};
use crate::types::{TrackKind, TrackKinds};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the per-track fan-out channel. Slow subscribers lag and drop
/// rather than stall the publisher.
pub const TRACK_FEED_CAPACITY: usize = 256;

/// Fan-out handle for one ingress track's RTP packets.
///
/// The publisher side pushes packets with [`TrackFeed::publish`]; each
/// subscriber forward task holds a receiver from [`TrackFeed::subscribe`].
/// Publishing never blocks and is independent of subscriber count.
#[derive(Debug, Clone)]
pub struct TrackFeed {
    kind: TrackKind,
    tx: broadcast::Sender<Bytes>,
}

impl TrackFeed {
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        let (tx, _) = broadcast::channel(TRACK_FEED_CAPACITY);
        Self { kind, tx }
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Push one RTP packet to every current subscriber. A feed with no
    /// subscribers silently drops the packet.
    pub fn publish(&self, packet: Bytes) {
        let _ = self.tx.send(packet);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// ICE transport statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct IceStats {
    pub requests_received: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub responses_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// A live media transport. `close` is idempotent.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn ice_stats(&self) -> IceStats;
    async fn close(&self);
}

/// One outbound track on a subscriber transport.
#[async_trait]
pub trait TrackSink: Send + Sync {
    fn kind(&self) -> TrackKind;
    async fn write(&self, packet: Bytes) -> RouterResult<()>;
}

/// Result of negotiating an ingress (publisher-side) transport.
pub struct IngressNegotiation {
    /// Identity of the incoming stream (msid when present, random otherwise).
    pub stream_id: String,
    /// Local answer SDP; `None` for relay ingress where the remote side
    /// answered our offer.
    pub answer: Option<String>,
    pub audio: Option<TrackFeed>,
    pub video: Option<TrackFeed>,
    pub transport: Arc<dyn MediaTransport>,
}

impl IngressNegotiation {
    #[must_use]
    pub fn kinds(&self) -> TrackKinds {
        TrackKinds {
            audio: self.audio.is_some(),
            video: self.video.is_some(),
        }
    }
}

/// Result of negotiating an egress (subscriber-side) transport.
pub struct EgressNegotiation {
    pub answer: String,
    pub audio: Option<Arc<dyn TrackSink>>,
    pub video: Option<Arc<dyn TrackSink>>,
    pub transport: Arc<dyn MediaTransport>,
}

/// A relay pull offer waiting for the origin's answer.
///
/// Two-phase because an SDP offer can only be completed by the transport
/// that produced it.
#[async_trait]
pub trait PendingRelayIngress: Send {
    fn offer(&self) -> &str;

    /// Finish negotiation with the origin's answer. Fails with
    /// [`RouterError::NoStreamInfo`] when the answer carries no media
    /// section.
    async fn complete(self: Box<Self>, answer: &str) -> RouterResult<IngressNegotiation>;
}

/// The media-engine capability consumed by routers, publishers and
/// subscribers.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Negotiate a publisher transport from a client offer. Must not leave
    /// any state behind on failure.
    async fn negotiate_ingress(
        &self,
        offer: &str,
        caps: &MediaCapabilities,
    ) -> RouterResult<IngressNegotiation>;

    /// Build a receive-only offer for a cluster relay pull.
    async fn create_relay_offer(
        &self,
        caps: &MediaCapabilities,
    ) -> RouterResult<Box<dyn PendingRelayIngress>>;

    /// Negotiate a subscriber transport from a viewer offer, carrying
    /// outbound tracks only for `kinds` (the kinds the publisher actually
    /// has). `stream_id` labels the outgoing stream (the subscriber id).
    async fn negotiate_egress(
        &self,
        offer: &str,
        caps: &MediaCapabilities,
        kinds: TrackKinds,
        stream_id: &str,
    ) -> RouterResult<EgressNegotiation>;
}

/// Media kinds present as `m=` sections of an SDP blob.
pub(crate) fn media_kinds_from_sdp(sdp: &str) -> TrackKinds {
    let mut kinds = TrackKinds::none();
    for line in sdp.lines() {
        let line = line.trim_end();
        if line.starts_with("m=audio") {
            kinds.audio = true;
        } else if line.starts_with("m=video") {
            kinds.video = true;
        }
    }
    kinds
}

/// First stream identity advertised by an `a=msid:` attribute, if any.
pub(crate) fn stream_id_from_sdp(sdp: &str) -> Option<String> {
    for line in sdp.lines() {
        if let Some(rest) = line.trim_end().strip_prefix("a=msid:") {
            let stream = rest.split_whitespace().next()?;
            if !stream.is_empty() && stream != "-" {
                return Some(stream.to_string());
            }
        }
    }
    None
}

/// Validate that an SDP blob has at least one audio/video section.
pub(crate) fn require_media(sdp: &str) -> RouterResult<TrackKinds> {
    let kinds = media_kinds_from_sdp(sdp);
    if kinds.is_empty() {
        return Err(RouterError::NoStreamInfo);
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_AV: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:cam0 a0\r\nm=video 9 UDP/TLS/RTP/SAVPF 102\r\na=msid:cam0 v0\r\n";

    #[test]
    fn test_media_kinds_scan() {
        let kinds = media_kinds_from_sdp(OFFER_AV);
        assert!(kinds.audio && kinds.video);

        let audio_only = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        let kinds = media_kinds_from_sdp(audio_only);
        assert!(kinds.audio && !kinds.video);
    }

    #[test]
    fn test_require_media_rejects_empty_sdp() {
        assert!(matches!(
            require_media("v=0\r\ns=-\r\n"),
            Err(RouterError::NoStreamInfo)
        ));
    }

    #[test]
    fn test_stream_id_from_msid() {
        assert_eq!(stream_id_from_sdp(OFFER_AV).as_deref(), Some("cam0"));
        assert_eq!(stream_id_from_sdp("v=0\r\n"), None);
    }

    #[tokio::test]
    async fn test_feed_fan_out() {
        let feed = TrackFeed::new(TrackKind::Audio);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.publish(Bytes::from_static(b"pkt"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"pkt"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"pkt"));
    }

    #[test]
    fn test_feed_without_subscribers_drops() {
        let feed = TrackFeed::new(TrackKind::Video);
        // No receivers: publish must not panic or block.
        feed.publish(Bytes::from_static(b"pkt"));
        assert_eq!(feed.receiver_count(), 0);
    }
}
