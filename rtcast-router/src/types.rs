//! Common identifier and media-kind types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one logical stream; also the identity of its router.
///
/// Chosen by the publishing client (or by routing config for relays); unique
/// among live routers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one subscriber, unique for the lifetime of its router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Generate a fresh random id (UUIDv4).
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which media kinds a negotiation should carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackKinds {
    pub audio: bool,
    pub video: bool,
}

impl TrackKinds {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    #[must_use]
    pub const fn both() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    /// Kinds present in both sets.
    #[must_use]
    pub const fn intersect(&self, other: Self) -> Self {
        Self {
            audio: self.audio && other.audio,
            video: self.video && other.video,
        }
    }

    #[must_use]
    pub const fn has(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}
