//! ffmpeg publisher: ingress pulled from an arbitrary input URL.
//!
//! An ffmpeg child copies H.264 and transcodes audio to Opus, emitting RTP
//! to the publisher's loopback sessions. Used by static relay entries to
//! materialize remote RTMP/HTTP sources as local streams.

use crate::capabilities::MediaCapabilities;
use crate::endpoint::rtp::RtpSession;
use crate::endpoint::TrackFeed;
use crate::error::{RouterError, RouterResult};
use crate::pipeline::{AUDIO_PAYLOAD_TYPE, VIDEO_PAYLOAD_TYPE};
use crate::types::TrackKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct FfPublisher {
    id: String,
    url: String,
    audio_session: Option<RtpSession>,
    video_session: Option<RtpSession>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl FfPublisher {
    /// Spawn the decode process for `url`. The returned channel fires once
    /// when the child exits, clean or not; the owner must stop the router
    /// in response.
    pub async fn spawn(
        stream_id: &str,
        url: &str,
        caps: &MediaCapabilities,
    ) -> RouterResult<(Self, oneshot::Receiver<RouterResult<()>>)> {
        let video_session = match caps.supports(TrackKind::Video) {
            true => Some(RtpSession::bind(TrackKind::Video).await?),
            false => None,
        };
        let audio_session = match caps.supports(TrackKind::Audio) {
            true => Some(RtpSession::bind(TrackKind::Audio).await?),
            false => None,
        };
        if video_session.is_none() && audio_session.is_none() {
            return Err(RouterError::Pipeline(
                "no media capabilities configured for ffmpeg ingest".into(),
            ));
        }

        let mut command = Command::new("ffmpeg");
        command.args(["-hide_banner", "-loglevel", "error"]);
        command.args(["-fflags", "nobuffer", "-i", url]);
        if let Some(session) = &video_session {
            command.args(["-vcodec", "copy", "-an", "-bsf:v", "h264_mp4toannexb"]);
            command.args(["-f", "rtp", "-payload_type", &VIDEO_PAYLOAD_TYPE.to_string()]);
            command.arg(format!("rtp://127.0.0.1:{}", session.local_port()));
        }
        if let Some(session) = &audio_session {
            command.args(["-acodec", "libopus", "-vn", "-ar", "48000", "-ac", "2"]);
            command.args(["-f", "rtp", "-payload_type", &AUDIO_PAYLOAD_TYPE.to_string()]);
            command.arg(format!("rtp://127.0.0.1:{}", session.local_port()));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| RouterError::Pipeline(format!("spawn ffmpeg: {err}")))?;

        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let monitor_cancel = cancel.clone();
        let stream = stream_id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                () = monitor_cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            let result = match status {
                Some(Ok(status)) if status.success() => {
                    debug!(stream = %stream, "ffmpeg ingest exited cleanly");
                    Ok(())
                }
                Some(Ok(status)) => {
                    warn!(stream = %stream, %status, "ffmpeg ingest exited");
                    Err(RouterError::Pipeline(format!("ffmpeg exited: {status}")))
                }
                Some(Err(err)) => Err(RouterError::Pipeline(format!("ffmpeg wait: {err}"))),
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok(())
                }
            };
            let _ = done_tx.send(result);
        });

        Ok((
            Self {
                id: stream_id.to_string(),
                url: url.to_string(),
                audio_session,
                video_session,
                cancel,
                stopped: AtomicBool::new(false),
            },
            done_rx,
        ))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&TrackFeed> {
        match kind {
            TrackKind::Audio => self.audio_session.as_ref().map(RtpSession::feed),
            TrackKind::Video => self.video_session.as_ref().map(RtpSession::feed),
        }
    }

    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            if let Some(session) = &self.audio_session {
                session.stop();
            }
            if let Some(session) = &self.video_session {
                session.stop();
            }
        }
    }
}
