//! WebRTC publisher: ingress negotiated directly from a client offer.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::{Endpoint, IngressNegotiation, MediaTransport, TrackFeed};
use crate::error::{RouterError, RouterResult};
use crate::types::TrackKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct RtcPublisher {
    id: String,
    answer: String,
    audio: Option<TrackFeed>,
    video: Option<TrackFeed>,
    transport: Arc<dyn MediaTransport>,
    stopped: AtomicBool,
}

impl RtcPublisher {
    /// Negotiate the ingress transport for `offer`. Fails without side
    /// effects on SDP or transport errors.
    pub async fn negotiate(
        endpoint: &dyn Endpoint,
        offer: &str,
        caps: &MediaCapabilities,
    ) -> RouterResult<Self> {
        let negotiation = endpoint.negotiate_ingress(offer, caps).await?;
        Self::from_negotiation(negotiation)
    }

    pub fn from_negotiation(negotiation: IngressNegotiation) -> RouterResult<Self> {
        let answer = negotiation.answer.ok_or_else(|| {
            RouterError::NegotiationFailed("ingress negotiation produced no answer".into())
        })?;
        Ok(Self {
            id: negotiation.stream_id,
            answer,
            audio: negotiation.audio,
            video: negotiation.video,
            transport: negotiation.transport,
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn answer(&self) -> &str {
        &self.answer
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&TrackFeed> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.transport.close().await;
        }
    }
}
