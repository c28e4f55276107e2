//! Relay publisher: ingress synthesized from a cluster pull.
//!
//! The transport was negotiated by the relay client (our offer, the origin's
//! answer). The publisher's identity is the subscriber id the origin edge
//! allocated for us, which is exactly what the origin expects back in
//! `/unpull`.

use crate::endpoint::{IngressNegotiation, MediaTransport, TrackFeed};
use crate::types::TrackKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct RelayPublisher {
    id: String,
    audio: Option<TrackFeed>,
    video: Option<TrackFeed>,
    transport: Arc<dyn MediaTransport>,
    stopped: AtomicBool,
}

impl RelayPublisher {
    #[must_use]
    pub fn from_negotiation(
        negotiation: IngressNegotiation,
        origin_subscriber_id: String,
    ) -> Self {
        Self {
            id: origin_subscriber_id,
            audio: negotiation.audio,
            video: negotiation.video,
            transport: negotiation.transport,
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
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
