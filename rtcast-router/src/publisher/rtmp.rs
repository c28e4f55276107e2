//! RTMP publisher: ingress from an RTMP push connection.
//!
//! The RTMP protocol server is an external collaborator; it hands this
//! publisher demuxed codec parameters and timed packets through the
//! [`RtmpSource`] contract. Video arrives as AVCC (length-prefixed) H.264
//! and is rewritten to Annex B with parameter-set re-injection on keyframes;
//! audio arrives as raw AAC frames and is wrapped in ADTS. Both are pushed
//! into per-kind transcode pipelines that emit RTP onto the publisher's
//! track feeds.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::TrackFeed;
use crate::error::{RouterError, RouterResult};
use crate::pipeline::TranscodePipeline;
use crate::types::TrackKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// MPEG-4 AudioSpecificConfig, as carried in the AAC sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Audio object type (2 = AAC-LC).
    pub object_type: u8,
    /// Sampling frequency index (4 = 44100 Hz).
    pub sampling_frequency_index: u8,
    /// Channel configuration (2 = stereo).
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> RouterResult<Self> {
        if data.len() < 2 {
            return Err(RouterError::Ingress(
                "audio specific config too short".into(),
            ));
        }
        Ok(Self {
            object_type: data[0] >> 3,
            sampling_frequency_index: ((data[0] & 0x07) << 1) | (data[1] >> 7),
            channel_config: (data[1] >> 3) & 0x0F,
        })
    }

    /// Build the 7-byte ADTS header for a frame of `frame_len` payload
    /// bytes (MPEG-4, no CRC).
    #[must_use]
    pub fn adts_header(&self, frame_len: usize) -> [u8; 7] {
        let full_len = frame_len + 7;
        let profile = self.object_type.saturating_sub(1) & 0x03;
        [
            0xFF,
            0xF1,
            (profile << 6)
                | ((self.sampling_frequency_index & 0x0F) << 2)
                | ((self.channel_config >> 2) & 0x01),
            ((self.channel_config & 0x03) << 6) | (((full_len >> 11) & 0x03) as u8),
            ((full_len >> 3) & 0xFF) as u8,
            (((full_len & 0x07) << 5) as u8) | 0x1F,
            0xFC,
        ]
    }
}

/// H.264 parameter sets from the AVC sequence header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub sps: Bytes,
    pub pps: Bytes,
    /// Byte width of AVCC NALU length prefixes (usually 4).
    pub nalu_length_size: u8,
}

impl AvcConfig {
    /// Parse an `AVCDecoderConfigurationRecord`, keeping the first SPS and
    /// PPS.
    pub fn parse(data: &[u8]) -> RouterResult<Self> {
        if data.len() < 8 || data[0] != 1 {
            return Err(RouterError::Ingress(
                "malformed avc decoder configuration record".into(),
            ));
        }
        let nalu_length_size = (data[4] & 0x03) + 1;

        let sps_count = data[5] & 0x1F;
        if sps_count == 0 {
            return Err(RouterError::Ingress("avc config carries no sps".into()));
        }
        let sps_len = u16::from_be_bytes([data[6], data[7]]) as usize;
        let sps_end = 8 + sps_len;
        if data.len() < sps_end + 1 {
            return Err(RouterError::Ingress("avc config truncated in sps".into()));
        }
        let sps = Bytes::copy_from_slice(&data[8..sps_end]);

        let pps_count = data[sps_end];
        if pps_count == 0 {
            return Err(RouterError::Ingress("avc config carries no pps".into()));
        }
        let pps_off = sps_end + 1;
        if data.len() < pps_off + 2 {
            return Err(RouterError::Ingress("avc config truncated in pps".into()));
        }
        let pps_len = u16::from_be_bytes([data[pps_off], data[pps_off + 1]]) as usize;
        let pps_end = pps_off + 2 + pps_len;
        if data.len() < pps_end {
            return Err(RouterError::Ingress("avc config truncated in pps".into()));
        }
        let pps = Bytes::copy_from_slice(&data[pps_off + 2..pps_end]);

        Ok(Self {
            sps,
            pps,
            nalu_length_size,
        })
    }
}

/// Codec parameters declared by an RTMP push before media flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtmpCodecData {
    H264(AvcConfig),
    Aac(AudioSpecificConfig),
}

/// One demuxed media packet from an RTMP connection.
///
/// Video data is AVCC (length-prefixed NALUs), audio data is one raw AAC
/// frame.
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub kind: TrackKind,
    pub is_keyframe: bool,
    pub timestamp_ms: u32,
    pub data: Bytes,
}

/// Demuxed RTMP connection: codec parameters plus a stream of packets.
///
/// `read_packet` returns `Ok(None)` on clean end-of-stream; the error case
/// covers connection drops and protocol failures.
#[async_trait]
pub trait RtmpSource: Send {
    fn codec_data(&self) -> &[RtmpCodecData];
    async fn read_packet(&mut self) -> RouterResult<Option<AvPacket>>;
}

/// Rewrite one AVCC packet as Annex B, optionally re-injecting parameter
/// sets in front.
fn build_annexb(data: &[u8], nalu_length_size: u8, params: Option<(&[u8], &[u8])>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    if let Some((sps, pps)) = params {
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(sps);
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(pps);
    }

    let prefix = nalu_length_size as usize;
    let mut pos = 0;
    while pos + prefix <= data.len() {
        let mut nalu_len = 0usize;
        for &byte in &data[pos..pos + prefix] {
            nalu_len = (nalu_len << 8) | byte as usize;
        }
        pos += prefix;
        if nalu_len == 0 || pos + nalu_len > data.len() {
            break;
        }
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(&data[pos..pos + nalu_len]);
        pos += nalu_len;
    }
    out
}

/// Per-pump demux state feeding the transcode pipelines.
struct RtmpDemux {
    video: Option<(Arc<TranscodePipeline>, AvcConfig)>,
    audio: Option<(Arc<TranscodePipeline>, AudioSpecificConfig)>,
    sent_parameter_sets: bool,
}

impl RtmpDemux {
    async fn write_packet(&mut self, packet: &AvPacket) -> RouterResult<()> {
        match packet.kind {
            TrackKind::Video => {
                let Some((pipeline, avc)) = &self.video else {
                    return Ok(());
                };
                let params = (packet.is_keyframe || !self.sent_parameter_sets)
                    .then(|| (avc.sps.as_ref(), avc.pps.as_ref()));
                let annexb = build_annexb(&packet.data, avc.nalu_length_size, params);
                if !annexb.is_empty() {
                    pipeline.push(&annexb).await?;
                    self.sent_parameter_sets = true;
                }
            }
            TrackKind::Audio => {
                let Some((pipeline, asc)) = &self.audio else {
                    return Ok(());
                };
                let mut frame = Vec::with_capacity(packet.data.len() + 7);
                frame.extend_from_slice(&asc.adts_header(packet.data.len()));
                frame.extend_from_slice(&packet.data);
                pipeline.push(&frame).await?;
            }
        }
        Ok(())
    }
}

/// RTMP ingress publisher.
pub struct RtmpPublisher {
    id: String,
    avc: Option<AvcConfig>,
    asc: Option<AudioSpecificConfig>,
    video_pipeline: Option<Arc<TranscodePipeline>>,
    audio_pipeline: Option<Arc<TranscodePipeline>>,
    stopped: AtomicBool,
}

impl RtmpPublisher {
    /// Stand up the transcode pipelines for every codec the connection
    /// declared and the edge supports.
    pub async fn new(
        stream_id: &str,
        codec_data: &[RtmpCodecData],
        caps: &MediaCapabilities,
    ) -> RouterResult<Self> {
        let mut avc = None;
        let mut asc = None;
        for codec in codec_data {
            match codec {
                RtmpCodecData::H264(config) if caps.supports(TrackKind::Video) => {
                    avc = Some(config.clone());
                }
                RtmpCodecData::Aac(config) if caps.supports(TrackKind::Audio) => {
                    asc = Some(*config);
                }
                other => debug!(stream = stream_id, codec = ?other, "ignoring unsupported rtmp codec"),
            }
        }
        if avc.is_none() && asc.is_none() {
            return Err(RouterError::Ingress(
                "rtmp connection declared no supported codec".into(),
            ));
        }

        let video_pipeline = match &avc {
            Some(_) => Some(Arc::new(TranscodePipeline::spawn(TrackKind::Video).await?)),
            None => None,
        };
        let audio_pipeline = match &asc {
            Some(_) => Some(Arc::new(TranscodePipeline::spawn(TrackKind::Audio).await?)),
            None => None,
        };

        Ok(Self {
            id: stream_id.to_string(),
            avc,
            asc,
            video_pipeline,
            audio_pipeline,
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&TrackFeed> {
        match kind {
            TrackKind::Audio => self.audio_pipeline.as_deref().map(TranscodePipeline::feed),
            TrackKind::Video => self.video_pipeline.as_deref().map(TranscodePipeline::feed),
        }
    }

    /// Start the packet-relay pump. The returned channel fires once, when
    /// the source ends: `Ok(())` on clean close, the error otherwise. The
    /// owner must react by stopping the router; the publisher does not tear
    /// itself down.
    pub fn start(&self, mut source: Box<dyn RtmpSource>) -> oneshot::Receiver<RouterResult<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        let mut demux = RtmpDemux {
            video: self
                .video_pipeline
                .clone()
                .zip(self.avc.clone()),
            audio: self.audio_pipeline.clone().zip(self.asc),
            sent_parameter_sets: false,
        };
        let stream = self.id.clone();

        tokio::spawn(async move {
            let result = async {
                while let Some(packet) = source.read_packet().await? {
                    demux.write_packet(&packet).await?;
                }
                Ok(())
            }
            .await;

            if let Err(err) = &result {
                warn!(stream = %stream, error = %err, "rtmp ingress pump ended with error");
            } else {
                debug!(stream = %stream, "rtmp ingress pump ended");
            }
            let _ = done_tx.send(result);
        });

        done_rx
    }

    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            if let Some(pipeline) = &self.audio_pipeline {
                pipeline.stop().await;
            }
            if let Some(pipeline) = &self.video_pipeline {
                pipeline.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_specific_config_parse() {
        // AAC-LC, 44.1 kHz, stereo.
        let asc = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(asc.object_type, 2);
        assert_eq!(asc.sampling_frequency_index, 4);
        assert_eq!(asc.channel_config, 2);

        assert!(AudioSpecificConfig::parse(&[0x12]).is_err());
    }

    #[test]
    fn test_adts_header_layout() {
        let asc = AudioSpecificConfig {
            object_type: 2,
            sampling_frequency_index: 4,
            channel_config: 2,
        };
        assert_eq!(
            asc.adts_header(100),
            [0xFF, 0xF1, 0x50, 0x80, 0x0D, 0x7F, 0xFC]
        );
    }

    #[test]
    fn test_avc_config_parse() {
        let sps = [0x67, 0x42, 0x00, 0x1F];
        let pps = [0x68, 0xCE, 0x3C, 0x80];
        let mut record = vec![0x01, 0x42, 0x00, 0x1F, 0xFF, 0xE1];
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(&sps);
        record.push(0x01);
        record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        record.extend_from_slice(&pps);

        let config = AvcConfig::parse(&record).unwrap();
        assert_eq!(config.sps.as_ref(), &sps);
        assert_eq!(config.pps.as_ref(), &pps);
        assert_eq!(config.nalu_length_size, 4);

        assert!(AvcConfig::parse(&[0x00, 0x42]).is_err());
    }

    #[test]
    fn test_avcc_to_annexb() {
        // Two NALUs with 4-byte length prefixes.
        let mut avcc = Vec::new();
        avcc.extend_from_slice(&4u32.to_be_bytes());
        avcc.extend_from_slice(&[0x65, 1, 2, 3]);
        avcc.extend_from_slice(&2u32.to_be_bytes());
        avcc.extend_from_slice(&[0x41, 4]);

        let out = build_annexb(&avcc, 4, None);
        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1, 0x65, 1, 2, 3]);
        expected.extend_from_slice(&[0, 0, 0, 1, 0x41, 4]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_annexb_parameter_set_injection() {
        let mut avcc = Vec::new();
        avcc.extend_from_slice(&1u32.to_be_bytes());
        avcc.push(0x65);

        let out = build_annexb(&avcc, 4, Some((&[0x67], &[0x68])));
        let expected = [
            0, 0, 0, 1, 0x67, // sps
            0, 0, 0, 1, 0x68, // pps
            0, 0, 0, 1, 0x65, // frame
        ];
        assert_eq!(out, expected);
    }

    #[test]
    fn test_annexb_truncated_input_is_dropped() {
        // Length prefix claims more bytes than present.
        let mut avcc = Vec::new();
        avcc.extend_from_slice(&9u32.to_be_bytes());
        avcc.extend_from_slice(&[0x65, 1]);
        assert!(build_annexb(&avcc, 4, None).is_empty());
    }
}
