//! Publisher variants
//!
//! The ingress side of one stream. All variants satisfy the same contract:
//! an identity, zero-or-one track feed per media kind (immutable once the
//! publisher exists), and an idempotent `stop` releasing every owned
//! transport/pipeline/process resource exactly once.

pub mod ffmpeg;
pub mod relay;
pub mod rtc;
pub mod rtmp;

pub use ffmpeg::FfPublisher;
pub use relay::RelayPublisher;
pub use rtc::RtcPublisher;
pub use rtmp::{AudioSpecificConfig, AvPacket, AvcConfig, RtmpCodecData, RtmpPublisher, RtmpSource};

use crate::endpoint::TrackFeed;
use crate::types::{TrackKind, TrackKinds};

/// Closed set of ingress variants.
pub enum Publisher {
    Rtc(RtcPublisher),
    Relay(RelayPublisher),
    Rtmp(RtmpPublisher),
    Ffmpeg(FfPublisher),
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Self::Rtc(_) => "Rtc",
            Self::Relay(_) => "Relay",
            Self::Rtmp(_) => "Rtmp",
            Self::Ffmpeg(_) => "Ffmpeg",
        };
        f.debug_struct("Publisher")
            .field("variant", &variant)
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl Publisher {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Rtc(p) => p.id(),
            Self::Relay(p) => p.id(),
            Self::Rtmp(p) => p.id(),
            Self::Ffmpeg(p) => p.id(),
        }
    }

    /// The audio feed, when this publisher carries audio.
    #[must_use]
    pub fn audio_track(&self) -> Option<&TrackFeed> {
        self.track(TrackKind::Audio)
    }

    /// The video feed, when this publisher carries video.
    #[must_use]
    pub fn video_track(&self) -> Option<&TrackFeed> {
        self.track(TrackKind::Video)
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&TrackFeed> {
        match self {
            Self::Rtc(p) => p.track(kind),
            Self::Relay(p) => p.track(kind),
            Self::Rtmp(p) => p.track(kind),
            Self::Ffmpeg(p) => p.track(kind),
        }
    }

    #[must_use]
    pub fn kinds(&self) -> TrackKinds {
        TrackKinds {
            audio: self.audio_track().is_some(),
            video: self.video_track().is_some(),
        }
    }

    /// The SDP answer produced during negotiation; only WebRTC publishers
    /// have one.
    #[must_use]
    pub fn answer(&self) -> Option<&str> {
        match self {
            Self::Rtc(p) => Some(p.answer()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_rtmp(&self) -> Option<&RtmpPublisher> {
        match self {
            Self::Rtmp(p) => Some(p),
            _ => None,
        }
    }

    /// Release all owned resources. Idempotent across variants.
    pub async fn stop(&self) {
        match self {
            Self::Rtc(p) => p.stop().await,
            Self::Relay(p) => p.stop().await,
            Self::Rtmp(p) => p.stop().await,
            Self::Ffmpeg(p) => p.stop().await,
        }
    }
}
