//! FLV tag adaptation for the RTMP ingest bridge
//!
//! The stream hub delivers RTMP media as FLV tag bodies. This module turns
//! them into the router's [`RtmpSource`] contract: sequence headers become
//! codec parameters, media tags become demuxed packets (AVCC video, raw AAC
//! audio).
//!
//! Tag layouts:
//!
//! ```text
//! video: | frame_type(4) codec_id(4) | avc_packet_type(8) | cts(24) | data |
//! audio: | format(4) rate(2) size(1) type(1) | aac_packet_type(8) | data  |
//! ```

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use bytes::Bytes;
use rtcast_router::publisher::{
    AudioSpecificConfig, AvPacket, AvcConfig, RtmpCodecData, RtmpSource,
};
use rtcast_router::{RouterError, RouterResult, TrackKind};
use std::collections::VecDeque;
use std::time::Duration;
use streamhub::define::{FrameData, FrameDataReceiver};
use tracing::debug;

/// Video codec id for AVC/H.264.
const FLV_CODEC_AVC: u8 = 7;
/// Audio format id for AAC.
const FLV_SOUND_FORMAT_AAC: u8 = 10;

const VIDEO_TAG_HEADER_LEN: usize = 5;
const AUDIO_TAG_HEADER_LEN: usize = 2;

enum ParsedTag {
    Codec(RtmpCodecData),
    Packet(AvPacket),
    Skip,
}

fn parse_frame(frame: FrameData) -> RouterResult<ParsedTag> {
    match frame {
        FrameData::Video { timestamp, data } => parse_video_tag(timestamp, data.freeze()),
        FrameData::Audio { timestamp, data } => parse_audio_tag(timestamp, data.freeze()),
        _ => Ok(ParsedTag::Skip),
    }
}

fn parse_video_tag(timestamp: u32, data: Bytes) -> RouterResult<ParsedTag> {
    if data.len() < VIDEO_TAG_HEADER_LEN {
        return Ok(ParsedTag::Skip);
    }
    let frame_type = (data[0] >> 4) & 0x0F;
    let codec_id = data[0] & 0x0F;
    if codec_id != FLV_CODEC_AVC {
        debug!(codec_id, "ignoring non-avc video tag");
        return Ok(ParsedTag::Skip);
    }

    match data[1] {
        // AVC sequence header: decoder configuration record.
        0 => Ok(ParsedTag::Codec(RtmpCodecData::H264(AvcConfig::parse(
            &data[VIDEO_TAG_HEADER_LEN..],
        )?))),
        // AVC NALUs.
        1 => Ok(ParsedTag::Packet(AvPacket {
            kind: TrackKind::Video,
            is_keyframe: frame_type == 1,
            timestamp_ms: timestamp,
            data: data.slice(VIDEO_TAG_HEADER_LEN..),
        })),
        _ => Ok(ParsedTag::Skip),
    }
}

fn parse_audio_tag(timestamp: u32, data: Bytes) -> RouterResult<ParsedTag> {
    if data.len() < AUDIO_TAG_HEADER_LEN {
        return Ok(ParsedTag::Skip);
    }
    let sound_format = data[0] >> 4;
    if sound_format != FLV_SOUND_FORMAT_AAC {
        debug!(sound_format, "ignoring non-aac audio tag");
        return Ok(ParsedTag::Skip);
    }

    match data[1] {
        // AAC sequence header: AudioSpecificConfig.
        0 => Ok(ParsedTag::Codec(RtmpCodecData::Aac(
            AudioSpecificConfig::parse(&data[AUDIO_TAG_HEADER_LEN..])?,
        ))),
        // Raw AAC frame.
        1 => Ok(ParsedTag::Packet(AvPacket {
            kind: TrackKind::Audio,
            is_keyframe: false,
            timestamp_ms: timestamp,
            data: data.slice(AUDIO_TAG_HEADER_LEN..),
        })),
        _ => Ok(ParsedTag::Skip),
    }
}

/// [`RtmpSource`] over a stream-hub frame channel.
pub struct FlvFrameSource {
    frames: FrameDataReceiver,
    codec_data: Vec<RtmpCodecData>,
    pending: VecDeque<AvPacket>,
}

impl FlvFrameSource {
    /// Consume frames until the connection's codec parameters are known:
    /// encoders send sequence headers before media, so the first media
    /// packet closes the header phase (and is kept for replay). Bails out
    /// when `timeout` elapses without any media.
    pub async fn negotiate(
        mut frames: FrameDataReceiver,
        timeout: Duration,
    ) -> ServerResult<Self> {
        let mut codec_data = Vec::new();
        let mut pending = VecDeque::new();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    match parse_frame(frame) {
                        Ok(ParsedTag::Codec(codec)) => codec_data.push(codec),
                        Ok(ParsedTag::Packet(packet)) => {
                            pending.push_back(packet);
                            break;
                        }
                        Ok(ParsedTag::Skip) => {}
                        Err(err) => {
                            return Err(ServerError::Rtmp(format!(
                                "malformed sequence header: {err}"
                            )))
                        }
                    }
                }
            }
        }

        if codec_data.is_empty() {
            return Err(ServerError::Rtmp(
                "rtmp connection sent no codec headers".into(),
            ));
        }
        Ok(Self {
            frames,
            codec_data,
            pending,
        })
    }
}

#[async_trait]
impl RtmpSource for FlvFrameSource {
    fn codec_data(&self) -> &[RtmpCodecData] {
        &self.codec_data
    }

    async fn read_packet(&mut self) -> RouterResult<Option<AvPacket>> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(packet));
        }
        loop {
            let Some(frame) = self.frames.recv().await else {
                // Channel closed: the publisher unpublished or dropped.
                return Ok(None);
            };
            match parse_frame(frame) {
                Ok(ParsedTag::Packet(packet)) => return Ok(Some(packet)),
                Ok(_) => {}
                Err(err) => {
                    return Err(RouterError::Ingress(format!("malformed media tag: {err}")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::sync::mpsc;

    fn avc_sequence_header() -> BytesMut {
        let sps = [0x67u8, 0x42, 0x00, 0x1F];
        let pps = [0x68u8, 0xCE, 0x3C, 0x80];
        let mut tag = BytesMut::new();
        tag.extend_from_slice(&[0x17, 0x00, 0, 0, 0]); // keyframe | avc, seq header, cts=0
        tag.extend_from_slice(&[0x01, 0x42, 0x00, 0x1F, 0xFF, 0xE1]);
        tag.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        tag.extend_from_slice(&sps);
        tag.extend_from_slice(&[0x01]);
        tag.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        tag.extend_from_slice(&pps);
        tag
    }

    fn aac_sequence_header() -> BytesMut {
        let mut tag = BytesMut::new();
        tag.extend_from_slice(&[0xAF, 0x00, 0x12, 0x10]); // aac, seq header, LC 44.1k stereo
        tag
    }

    fn video_frame(keyframe: bool) -> BytesMut {
        let mut tag = BytesMut::new();
        tag.extend_from_slice(&[if keyframe { 0x17 } else { 0x27 }, 0x01, 0, 0, 0]);
        tag.extend_from_slice(&2u32.to_be_bytes());
        tag.extend_from_slice(&[0x65, 0xAA]);
        tag
    }

    #[tokio::test]
    async fn test_negotiate_collects_headers_and_replays_first_packet() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(FrameData::Video {
            timestamp: 0,
            data: avc_sequence_header(),
        })
        .unwrap();
        tx.send(FrameData::Audio {
            timestamp: 0,
            data: aac_sequence_header(),
        })
        .unwrap();
        tx.send(FrameData::Video {
            timestamp: 40,
            data: video_frame(true),
        })
        .unwrap();

        let mut source = FlvFrameSource::negotiate(rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(source.codec_data().len(), 2);

        let packet = source.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.kind, TrackKind::Video);
        assert!(packet.is_keyframe);
        assert_eq!(packet.timestamp_ms, 40);
        // Tag header stripped: AVCC payload only.
        assert_eq!(packet.data.len(), 6);

        // Channel close ends the stream cleanly.
        drop(tx);
        assert!(source.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negotiate_without_headers_fails() {
        let (tx, rx) = mpsc::unbounded_channel::<FrameData>();
        drop(tx);
        assert!(
            FlvFrameSource::negotiate(rx, Duration::from_millis(100))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_audio_frames_are_demuxed() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(FrameData::Audio {
            timestamp: 0,
            data: aac_sequence_header(),
        })
        .unwrap();
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&[0xAF, 0x01, 0xDE, 0xAD, 0xBE, 0xEF]);
        tx.send(FrameData::Audio {
            timestamp: 23,
            data: raw,
        })
        .unwrap();

        let mut source = FlvFrameSource::negotiate(rx, Duration::from_secs(1))
            .await
            .unwrap();
        let packet = source.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.kind, TrackKind::Audio);
        assert_eq!(packet.data.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
