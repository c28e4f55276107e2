//! Negotiated media capability sets
//!
//! A router is created with the edge's configured capabilities; every
//! publisher and subscriber on that router negotiates against the same set,
//! so a subscriber's tracks are always a subset of what the publisher
//! carries.

use crate::types::{TrackKind, TrackKinds};
use serde::{Deserialize, Serialize};

/// RTCP feedback mechanism advertised for a codec (e.g. `nack`, `goog-remb`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    pub id: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Capability set for one media kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapability {
    /// Codec names in preference order (e.g. `opus`, `h264`).
    pub codecs: Vec<String>,
    /// Whether retransmission streams are offered (video only).
    #[serde(default)]
    pub rtx: bool,
    /// Header extension URIs.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// RTCP feedback mechanisms.
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl CodecCapability {
    /// Preferred codec name, if any codec is configured.
    #[must_use]
    pub fn preferred_codec(&self) -> Option<&str> {
        self.codecs.first().map(String::as_str)
    }
}

/// The edge's full capability set, one entry per media kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapabilities {
    pub audio: Option<CodecCapability>,
    pub video: Option<CodecCapability>,
}

impl MediaCapabilities {
    #[must_use]
    pub fn supports(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio.is_some(),
            TrackKind::Video => self.video.is_some(),
        }
    }

    #[must_use]
    pub fn kinds(&self) -> TrackKinds {
        TrackKinds {
            audio: self.audio.is_some(),
            video: self.video.is_some(),
        }
    }

    #[must_use]
    pub fn capability(&self, kind: TrackKind) -> Option<&CodecCapability> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Opus/H.264 defaults matching what browsers ship; used when no
    /// capability section is configured explicitly.
    #[must_use]
    pub fn browser_defaults() -> Self {
        Self {
            audio: Some(CodecCapability {
                codecs: vec!["opus".to_string()],
                rtx: false,
                extensions: vec![
                    "urn:ietf:params:rtp-hdrext:ssrc-audio-level".to_string(),
                ],
                rtcp_feedback: Vec::new(),
            }),
            video: Some(CodecCapability {
                codecs: vec!["h264".to_string()],
                rtx: true,
                extensions: vec![
                    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
                        .to_string(),
                ],
                rtcp_feedback: vec![
                    RtcpFeedback {
                        id: "nack".to_string(),
                        params: vec![],
                    },
                    RtcpFeedback {
                        id: "nack".to_string(),
                        params: vec!["pli".to_string()],
                    },
                    RtcpFeedback {
                        id: "goog-remb".to_string(),
                        params: vec![],
                    },
                ],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_configured_capabilities() {
        let caps = MediaCapabilities {
            audio: Some(CodecCapability {
                codecs: vec!["opus".to_string()],
                ..Default::default()
            }),
            video: None,
        };
        assert!(caps.supports(TrackKind::Audio));
        assert!(!caps.supports(TrackKind::Video));
        assert_eq!(
            caps.kinds(),
            TrackKinds {
                audio: true,
                video: false
            }
        );
    }

    #[test]
    fn test_browser_defaults_cover_both_kinds() {
        let caps = MediaCapabilities::browser_defaults();
        assert!(caps.kinds().audio && caps.kinds().video);
        assert_eq!(caps.audio.unwrap().preferred_codec(), Some("opus"));
    }
}
