//! Production endpoint over webrtc-rs
//!
//! Peer connections negotiate non-trickle (the answer is returned with
//! candidates already gathered, so the control plane stays a single
//! request/response exchange). Ingress tracks are pumped into [`TrackFeed`]s
//! by per-track reader tasks; egress tracks are `TrackLocalStaticRTP`
//! instances that rewrite SSRC/payload type per negotiation, so feeds can be
//! wired straight through.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::{
    media_kinds_from_sdp, require_media, stream_id_from_sdp, EgressNegotiation, Endpoint,
    IceStats, IngressNegotiation, MediaTransport, PendingRelayIngress, TrackFeed, TrackSink,
};
use crate::error::{RouterError, RouterResult};
use crate::types::{TrackKind, TrackKinds};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

/// MTU-sized scratch buffer for RTP/RTCP reads.
const READ_BUF_SIZE: usize = 1500;

/// WebRTC endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN server URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Public address advertised as a 1:1 NAT mapping (edge behind NAT).
    pub public_ip: Option<String>,
}

/// Production [`Endpoint`] backed by the `webrtc` crate.
pub struct WebRtcEndpoint {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcEndpoint {
    pub fn new(config: WebRtcConfig) -> RouterResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation_err)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(negotiation_err)?;

        let mut setting_engine = SettingEngine::default();
        if let Some(public_ip) = &config.public_ip {
            setting_engine
                .set_nat_1to1_ips(vec![public_ip.clone()], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self { api, config })
    }

    async fn new_peer_connection(&self) -> RouterResult<Arc<RTCPeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(negotiation_err)?,
        );

        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(%state, "peer connection state changed");
            Box::pin(async {})
        }));

        Ok(pc)
    }

    /// Install an `on_track` handler pumping incoming RTP into the feeds.
    fn wire_incoming_tracks(
        pc: &Arc<RTCPeerConnection>,
        audio: Option<TrackFeed>,
        video: Option<TrackFeed>,
    ) {
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let audio = audio.clone();
            let video = video.clone();
            Box::pin(async move {
                let feed = match track.kind() {
                    RTPCodecType::Audio => audio,
                    RTPCodecType::Video => video,
                    _ => None,
                };
                match feed {
                    Some(feed) => spawn_track_reader(track, feed),
                    None => warn!(kind = %track.kind(), "incoming track without negotiated feed"),
                }
            })
        }));
    }

    /// Create the answer for an already-set remote offer, gathering
    /// candidates before returning (non-trickle).
    async fn answer_remote(pc: &Arc<RTCPeerConnection>) -> RouterResult<String> {
        let answer = pc.create_answer(None).await.map_err(negotiation_err)?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(negotiation_err)?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| RouterError::NegotiationFailed("missing local description".into()))?;
        Ok(local.sdp)
    }
}

#[async_trait]
impl Endpoint for WebRtcEndpoint {
    async fn negotiate_ingress(
        &self,
        offer: &str,
        caps: &MediaCapabilities,
    ) -> RouterResult<IngressNegotiation> {
        let offered = require_media(offer)?;
        let kinds = offered.intersect(caps.kinds());
        if kinds.is_empty() {
            return Err(RouterError::NegotiationFailed(
                "no offered media kind matches local capabilities".into(),
            ));
        }

        let pc = self.new_peer_connection().await?;
        let audio = kinds.audio.then(|| TrackFeed::new(TrackKind::Audio));
        let video = kinds.video.then(|| TrackFeed::new(TrackKind::Video));
        Self::wire_incoming_tracks(&pc, audio.clone(), video.clone());

        let result = async {
            let remote =
                RTCSessionDescription::offer(offer.to_string()).map_err(negotiation_err)?;
            pc.set_remote_description(remote)
                .await
                .map_err(negotiation_err)?;
            Self::answer_remote(&pc).await
        }
        .await;

        let answer = match result {
            Ok(answer) => answer,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err);
            }
        };

        let stream_id =
            stream_id_from_sdp(offer).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(IngressNegotiation {
            stream_id,
            answer: Some(answer),
            audio,
            video,
            transport: Arc::new(PeerTransport { pc }),
        })
    }

    async fn create_relay_offer(
        &self,
        caps: &MediaCapabilities,
    ) -> RouterResult<Box<dyn PendingRelayIngress>> {
        let kinds = caps.kinds();
        if kinds.is_empty() {
            return Err(RouterError::NegotiationFailed(
                "no media capabilities configured for relay pull".into(),
            ));
        }

        let pc = self.new_peer_connection().await?;
        let audio = kinds.audio.then(|| TrackFeed::new(TrackKind::Audio));
        let video = kinds.video.then(|| TrackFeed::new(TrackKind::Video));
        Self::wire_incoming_tracks(&pc, audio.clone(), video.clone());

        let result = async {
            let recvonly = || {
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                })
            };
            if kinds.audio {
                pc.add_transceiver_from_kind(RTPCodecType::Audio, recvonly())
                    .await
                    .map_err(negotiation_err)?;
            }
            if kinds.video {
                pc.add_transceiver_from_kind(RTPCodecType::Video, recvonly())
                    .await
                    .map_err(negotiation_err)?;
            }

            let offer = pc.create_offer(None).await.map_err(negotiation_err)?;
            let mut gather_complete = pc.gathering_complete_promise().await;
            pc.set_local_description(offer)
                .await
                .map_err(negotiation_err)?;
            let _ = gather_complete.recv().await;

            pc.local_description()
                .await
                .map(|desc| desc.sdp)
                .ok_or_else(|| RouterError::NegotiationFailed("missing local description".into()))
        }
        .await;

        match result {
            Ok(offer) => Ok(Box::new(PendingWebRtcRelay {
                pc,
                offer,
                audio,
                video,
            })),
            Err(err) => {
                let _ = pc.close().await;
                Err(err)
            }
        }
    }

    async fn negotiate_egress(
        &self,
        offer: &str,
        caps: &MediaCapabilities,
        kinds: TrackKinds,
        stream_id: &str,
    ) -> RouterResult<EgressNegotiation> {
        let offered = require_media(offer)?;
        let kinds = kinds.intersect(offered).intersect(caps.kinds());

        let pc = self.new_peer_connection().await?;
        let result = async {
            let mut audio: Option<Arc<dyn TrackSink>> = None;
            let mut video: Option<Arc<dyn TrackSink>> = None;
            for kind in [TrackKind::Audio, TrackKind::Video] {
                if !kinds.has(kind) {
                    continue;
                }
                let track = Arc::new(TrackLocalStaticRTP::new(
                    codec_capability(kind, caps),
                    kind.as_str().to_string(),
                    stream_id.to_string(),
                ));
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(negotiation_err)?;

                // The sender's RTCP stream must be drained for interceptors
                // (NACK, REMB) to run.
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; READ_BUF_SIZE];
                    while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
                });

                let sink: Arc<dyn TrackSink> = Arc::new(RtpTrackSink { kind, track });
                match kind {
                    TrackKind::Audio => audio = Some(sink),
                    TrackKind::Video => video = Some(sink),
                }
            }

            let remote =
                RTCSessionDescription::offer(offer.to_string()).map_err(negotiation_err)?;
            pc.set_remote_description(remote)
                .await
                .map_err(negotiation_err)?;
            let answer = Self::answer_remote(&pc).await?;
            Ok((answer, audio, video))
        }
        .await;

        match result {
            Ok((answer, audio, video)) => Ok(EgressNegotiation {
                answer,
                audio,
                video,
                transport: Arc::new(PeerTransport { pc }),
            }),
            Err(err) => {
                let _ = pc.close().await;
                Err(err)
            }
        }
    }
}

/// Relay pull offer bound to the peer connection that produced it.
struct PendingWebRtcRelay {
    pc: Arc<RTCPeerConnection>,
    offer: String,
    audio: Option<TrackFeed>,
    video: Option<TrackFeed>,
}

#[async_trait]
impl PendingRelayIngress for PendingWebRtcRelay {
    fn offer(&self) -> &str {
        &self.offer
    }

    async fn complete(self: Box<Self>, answer: &str) -> RouterResult<IngressNegotiation> {
        let result = async {
            require_media(answer)?;
            let remote =
                RTCSessionDescription::answer(answer.to_string()).map_err(negotiation_err)?;
            self.pc
                .set_remote_description(remote)
                .await
                .map_err(negotiation_err)
        }
        .await;

        if let Err(err) = result {
            let _ = self.pc.close().await;
            return Err(err);
        }

        let stream_id =
            stream_id_from_sdp(answer).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let answered = media_kinds_from_sdp(answer);

        Ok(IngressNegotiation {
            stream_id,
            answer: None,
            audio: self.audio.filter(|_| answered.audio),
            video: self.video.filter(|_| answered.video),
            transport: Arc::new(PeerTransport { pc: self.pc }),
        })
    }
}

/// Transport handle over one peer connection.
struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaTransport for PeerTransport {
    async fn ice_stats(&self) -> IceStats {
        let report = self.pc.get_stats().await;
        let mut stats = IceStats::default();
        for entry in report.reports.into_values() {
            if let StatsReportType::CandidatePair(pair) = entry {
                stats.requests_received += pair.requests_received;
                stats.requests_sent += pair.requests_sent;
                stats.responses_received += pair.responses_received;
                stats.responses_sent += pair.responses_sent;
                stats.bytes_received += pair.bytes_received;
                stats.bytes_sent += pair.bytes_sent;
            }
        }
        stats
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close failed");
        }
    }
}

/// Egress track writing raw RTP through a `TrackLocalStaticRTP`.
struct RtpTrackSink {
    kind: TrackKind,
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl TrackSink for RtpTrackSink {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn write(&self, packet: Bytes) -> RouterResult<()> {
        self.track
            .write(&packet)
            .await
            .map(|_| ())
            .map_err(|err| RouterError::Transport(err.to_string()))
    }
}

/// Spawn the RTP reader pumping one remote track into its feed.
fn spawn_track_reader(track: Arc<TrackRemote>, feed: TrackFeed) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match track.read(&mut buf).await {
                Ok((packet, _attributes)) => {
                    let size = packet.header.marshal_size() + packet.payload.len();
                    feed.publish(Bytes::copy_from_slice(&buf[..size]));
                }
                Err(err) => {
                    debug!(kind = %feed.kind(), error = %err, "incoming track reader stopped");
                    break;
                }
            }
        }
    });
}

fn codec_capability(kind: TrackKind, caps: &MediaCapabilities) -> RTCRtpCodecCapability {
    let preferred = caps
        .capability(kind)
        .and_then(|c| c.preferred_codec())
        .map(str::to_ascii_lowercase);

    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => {
            let mime_type = match preferred.as_deref() {
                Some("vp8") => MIME_TYPE_VP8,
                _ => MIME_TYPE_H264,
            };
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            }
        }
    }
}

fn negotiation_err(err: webrtc::Error) -> RouterError {
    RouterError::NegotiationFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_capability_mapping() {
        let caps = MediaCapabilities::browser_defaults();
        let audio = codec_capability(TrackKind::Audio, &caps);
        assert_eq!(audio.mime_type, MIME_TYPE_OPUS);
        assert_eq!(audio.clock_rate, 48000);

        let video = codec_capability(TrackKind::Video, &caps);
        assert_eq!(video.mime_type, MIME_TYPE_H264);

        let mut vp8_caps = caps;
        if let Some(video) = vp8_caps.video.as_mut() {
            video.codecs = vec!["vp8".to_string()];
        }
        let video = codec_capability(TrackKind::Video, &vp8_caps);
        assert_eq!(video.mime_type, MIME_TYPE_VP8);
    }
}
