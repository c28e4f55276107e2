//! Elementary-stream → RTP transcode pipelines
//!
//! The RTMP publisher bridges demuxed H.264/AAC into RTP by feeding an
//! ffmpeg child over stdin and receiving RTP on a loopback [`RtpSession`]:
//! video is repackaged (`-c:v copy`), audio is transcoded to Opus. One
//! pipeline per media kind, owned by the publisher for its lifetime.

use crate::endpoint::rtp::RtpSession;
use crate::endpoint::TrackFeed;
use crate::error::{RouterError, RouterResult};
use crate::types::TrackKind;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Payload types fed into the loopback sessions. Downstream egress rewrites
/// the payload type per negotiation, so these only need to be consistent
/// with the pipeline arguments.
pub const VIDEO_PAYLOAD_TYPE: u8 = 102;
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;

/// One ffmpeg child converting an elementary stream on stdin into RTP on a
/// loopback port.
pub struct TranscodePipeline {
    kind: TrackKind,
    session: RtpSession,
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
}

impl TranscodePipeline {
    /// Spawn the pipeline for `kind`.
    pub async fn spawn(kind: TrackKind) -> RouterResult<Self> {
        let session = RtpSession::bind(kind).await?;
        let port = session.local_port();

        let mut command = Command::new("ffmpeg");
        command.args(["-hide_banner", "-loglevel", "error", "-fflags", "nobuffer"]);
        match kind {
            TrackKind::Video => {
                command.args(["-f", "h264", "-i", "pipe:0", "-c:v", "copy", "-an"]);
                command.args(["-f", "rtp", "-payload_type", &VIDEO_PAYLOAD_TYPE.to_string()]);
            }
            TrackKind::Audio => {
                command.args(["-f", "aac", "-i", "pipe:0"]);
                command.args(["-c:a", "libopus", "-ar", "48000", "-ac", "2", "-vn"]);
                command.args(["-f", "rtp", "-payload_type", &AUDIO_PAYLOAD_TYPE.to_string()]);
            }
        }
        command.arg(format!("rtp://127.0.0.1:{port}"));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| RouterError::Pipeline(format!("spawn ffmpeg: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RouterError::Pipeline("ffmpeg stdin unavailable".into()))?;

        let cancel = CancellationToken::new();
        let monitor_cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                () = monitor_cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match status {
                Some(Ok(status)) => debug!(kind = %kind, %status, "transcode pipeline exited"),
                Some(Err(err)) => warn!(kind = %kind, error = %err, "transcode pipeline wait failed"),
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!(kind = %kind, "transcode pipeline stopped");
                }
            }
        });

        Ok(Self {
            kind,
            session,
            stdin: Mutex::new(Some(stdin)),
            cancel,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub const fn feed(&self) -> &TrackFeed {
        self.session.feed()
    }

    /// Feed one elementary-stream chunk into the child. A stopped pipeline
    /// swallows the write.
    pub async fn push(&self, data: &[u8]) -> RouterResult<()> {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            stdin
                .write_all(data)
                .await
                .map_err(|err| RouterError::Pipeline(format!("pipeline write: {err}")))?;
        }
        Ok(())
    }

    /// Kill the child and stop the RTP session. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.stdin.lock().await.take();
        self.session.stop();
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
