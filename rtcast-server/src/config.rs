//! Server configuration
//!
//! Loaded from a YAML/TOML file plus `RTCAST_`-prefixed environment
//! overrides (`RTCAST_SERVER__PORT=5001`). The capability section mirrors
//! the control-plane negotiation: at least one media kind must be
//! configured.

use crate::error::{ServerError, ServerResult};
use config::{Environment, File};
use rtcast_router::endpoint::webrtc::WebRtcConfig;
use rtcast_router::{CodecCapability, MediaCapabilities, RtcpFeedback};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub rtmp: RtmpConfig,
    pub cluster: ClusterConfig,
    pub logging: LoggingConfig,
    pub capability: CapabilityConfig,
    #[serde(rename = "relay")]
    pub relays: Vec<RelayEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Public address advertised when the edge sits behind 1:1 NAT.
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    /// RTMP ingest port; 0 disables the listener.
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Origin edges tried in order on a local cache miss.
    pub origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub audio: Option<AudioCapabilityConfig>,
    pub video: Option<VideoCapabilityConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioCapabilityConfig {
    pub codecs: Vec<String>,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCapabilityConfig {
    pub codecs: Vec<String>,
    pub rtx: bool,
    pub extensions: Vec<String>,
    #[serde(rename = "rtcpfbc")]
    pub rtcp_feedback: Vec<RtcpFeedbackConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcpFeedbackConfig {
    pub id: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// Pulled at startup and kept registered for its lifetime.
    Static,
    /// Marks an extra cluster origin for on-demand pulls.
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEntry {
    #[serde(rename = "type")]
    pub kind: RelayKind,
    /// Stream id the relay publishes under (static relays).
    #[serde(default)]
    pub stream: Option<String>,
    /// Source URL an ffmpeg publisher pulls (static relays).
    #[serde(default)]
    pub url: Option<String>,
    /// Origin edge address (dynamic relays).
    #[serde(default)]
    pub edge: Option<String>,
}

impl Config {
    /// Load from a file path plus environment overrides.
    pub fn from_file(path: &str) -> ServerResult<Self> {
        Self::load(Some(path))
    }

    /// Load from environment variables only.
    pub fn from_env() -> ServerResult<Self> {
        Self::load(None)
    }

    fn load(path: Option<&str>) -> ServerResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("RTCAST")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on misconfigurations.
    pub fn validate(&self) -> ServerResult<()> {
        let audio_empty = self
            .capability
            .audio
            .as_ref()
            .is_none_or(|a| a.codecs.is_empty());
        let video_empty = self
            .capability
            .video
            .as_ref()
            .is_none_or(|v| v.codecs.is_empty());
        if audio_empty && video_empty {
            return Err(ServerError::Config("capability can not be empty".into()));
        }

        let mut dynamic_seen = false;
        for relay in &self.relays {
            match relay.kind {
                RelayKind::Static => {
                    if relay.stream.as_deref().unwrap_or_default().is_empty() {
                        return Err(ServerError::Config(
                            "static relay should have a stream name".into(),
                        ));
                    }
                    if relay.url.as_deref().unwrap_or_default().is_empty() {
                        return Err(ServerError::Config(
                            "static relay should have a source url".into(),
                        ));
                    }
                }
                RelayKind::Dynamic => {
                    if dynamic_seen {
                        return Err(ServerError::Config(
                            "at most one dynamic relay may be configured".into(),
                        ));
                    }
                    dynamic_seen = true;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Capability config translated for negotiation.
    #[must_use]
    pub fn capabilities(&self) -> MediaCapabilities {
        let audio = self
            .capability
            .audio
            .as_ref()
            .filter(|a| !a.codecs.is_empty())
            .map(|a| CodecCapability {
                codecs: a.codecs.clone(),
                rtx: false,
                extensions: a.extensions.clone(),
                rtcp_feedback: Vec::new(),
            });
        let video = self
            .capability
            .video
            .as_ref()
            .filter(|v| !v.codecs.is_empty())
            .map(|v| CodecCapability {
                codecs: v.codecs.clone(),
                rtx: v.rtx,
                extensions: v.extensions.clone(),
                rtcp_feedback: v
                    .rtcp_feedback
                    .iter()
                    .map(|fb| RtcpFeedback {
                        id: fb.id.clone(),
                        params: fb.params.clone(),
                    })
                    .collect(),
            });
        MediaCapabilities { audio, video }
    }

    #[must_use]
    pub fn webrtc(&self) -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: self.media.ice_servers.clone(),
            public_ip: self.media.public_ip.clone(),
        }
    }

    /// Cluster origins: the configured list plus any dynamic relay edge.
    #[must_use]
    pub fn cluster_origins(&self) -> Vec<String> {
        let mut origins = self.cluster.origins.clone();
        for relay in &self.relays {
            if relay.kind == RelayKind::Dynamic {
                if let Some(edge) = relay.edge.as_ref().filter(|e| !e.is_empty()) {
                    origins.push(edge.clone());
                }
            }
        }
        origins
    }

    /// Static relay entries as `(stream, url)` pairs.
    #[must_use]
    pub fn static_relays(&self) -> Vec<(String, String)> {
        self.relays
            .iter()
            .filter(|r| r.kind == RelayKind::Static)
            .filter_map(|r| Some((r.stream.clone()?, r.url.clone()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  host: 127.0.0.1
  port: 5001
media:
  ice_servers:
    - stun:stun.l.google.com:19302
rtmp:
  port: 1935
cluster:
  origins:
    - 10.0.0.2:5000
capability:
  audio:
    codecs: [opus]
    extensions:
      - urn:ietf:params:rtp-hdrext:ssrc-audio-level
  video:
    codecs: [h264]
    rtx: true
    rtcpfbc:
      - id: nack
      - id: nack
        params: [pli]
relay:
  - type: static
    stream: promo
    url: rtmp://upstream.example.com/live/promo
  - type: dynamic
    edge: 10.0.0.3:5000
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_sample_config_round_trip() {
        let file = write_config(SAMPLE);
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.listen_address(), "127.0.0.1:5001");
        assert_eq!(config.rtmp.port, 1935);
        assert_eq!(
            config.cluster_origins(),
            vec!["10.0.0.2:5000".to_string(), "10.0.0.3:5000".to_string()]
        );
        assert_eq!(
            config.static_relays(),
            vec![(
                "promo".to_string(),
                "rtmp://upstream.example.com/live/promo".to_string()
            )]
        );

        let caps = config.capabilities();
        assert!(caps.audio.is_some() && caps.video.is_some());
        let video = caps.video.unwrap();
        assert!(video.rtx);
        assert_eq!(video.rtcp_feedback.len(), 2);
        assert_eq!(video.rtcp_feedback[1].params, vec!["pli".to_string()]);
    }

    #[test]
    fn test_empty_capability_is_rejected() {
        let file = write_config("server:\n  port: 5000\n");
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("capability"));
    }

    #[test]
    fn test_static_relay_requires_stream_and_url() {
        let file = write_config(
            r#"
capability:
  audio:
    codecs: [opus]
relay:
  - type: static
    url: rtmp://upstream.example.com/live/a
"#,
        );
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("static relay"));
    }

    #[test]
    fn test_second_dynamic_relay_is_rejected() {
        let file = write_config(
            r#"
capability:
  audio:
    codecs: [opus]
relay:
  - type: dynamic
    edge: a:5000
  - type: dynamic
    edge: b:5000
"#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}
