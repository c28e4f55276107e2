//! Loopback RTP ingest sessions
//!
//! Non-WebRTC publishers (RTMP, ffmpeg) produce RTP by pointing a local
//! pipeline at a loopback UDP port. An [`RtpSession`] owns that port and
//! republishes every received datagram on a [`TrackFeed`], which makes the
//! ingress indistinguishable from a WebRTC track to the rest of the router.

use crate::endpoint::TrackFeed;
use crate::error::RouterResult;
use crate::types::TrackKind;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Datagrams larger than one MTU are not valid RTP here.
const MAX_RTP_PACKET: usize = 1500;

/// One loopback UDP port receiving RTP for a single track.
pub struct RtpSession {
    feed: TrackFeed,
    local_port: u16,
    cancel: CancellationToken,
}

impl RtpSession {
    /// Bind a fresh loopback port and start the reader task.
    pub async fn bind(kind: TrackKind) -> RouterResult<Self> {
        let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await?);
        let local_port = socket.local_addr()?.port();
        let feed = TrackFeed::new(kind);
        let cancel = CancellationToken::new();

        let reader_feed = feed.clone();
        let reader_cancel = cancel.clone();
        let reader_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_RTP_PACKET];
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    received = reader_socket.recv(&mut buf) => match received {
                        Ok(0) => continue,
                        Ok(n) => reader_feed.publish(Bytes::copy_from_slice(&buf[..n])),
                        Err(err) => {
                            debug!(kind = %reader_feed.kind(), error = %err, "rtp session socket error");
                            break;
                        }
                    },
                }
            }
            debug!(kind = %reader_feed.kind(), port = local_port, "rtp session reader stopped");
        });

        Ok(Self {
            feed,
            local_port,
            cancel,
        })
    }

    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    #[must_use]
    pub const fn feed(&self) -> &TrackFeed {
        &self.feed
    }

    /// Stop the reader task. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_republishes_datagrams() {
        let session = RtpSession::bind(TrackKind::Video).await.unwrap();
        let mut rx = session.feed().subscribe();

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        sender
            .send_to(b"fake-rtp", ("127.0.0.1", session.local_port()))
            .await
            .unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .unwrap();
        assert_eq!(packet, Bytes::from_static(b"fake-rtp"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let session = RtpSession::bind(TrackKind::Audio).await.unwrap();
        session.stop();
        session.stop();
    }
}
