//! rtcast media router
//!
//! Core session management for the rtcast live-streaming edge: per-stream
//! routers binding one publisher to many subscribers, the process-wide
//! session registry, and the cluster relay client that pulls streams from
//! other edges.
//!
//! ## Architecture
//!
//! - **`MediaRouter`**: per-stream aggregate owning one publisher and the
//!   subscriber map
//! - **`Publisher`**: ingress variants (WebRTC, cluster relay, RTMP, ffmpeg)
//! - **`Subscriber`**: one viewer's egress transport and track forwarding
//! - **`SessionRegistry`**: stream-id → router and connection → session maps
//! - **`RelayClient`**: edge-to-edge pull/unpull protocol
//! - **`Endpoint`**: the media-engine boundary (SDP negotiation, transports,
//!   track fan-out); `WebRtcEndpoint` is the production implementation
//!
//! The router never owns codec or ICE logic; those live behind the
//! [`endpoint::Endpoint`] trait so the whole lifecycle is testable with the
//! scripted endpoint in [`testing`].

pub mod capabilities;
pub mod endpoint;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod relay;
pub mod router;
pub mod subscriber;
pub mod testing;
pub mod types;

pub use capabilities::{CodecCapability, MediaCapabilities, RtcpFeedback};
pub use endpoint::{EgressNegotiation, Endpoint, IngressNegotiation, TrackFeed};
pub use error::{RouterError, RouterResult};
pub use publisher::Publisher;
pub use registry::{ConnId, ConnState, SessionRegistry};
pub use relay::RelayClient;
pub use router::MediaRouter;
pub use subscriber::Subscriber;
pub use types::{StreamId, SubscriberId, TrackKind, TrackKinds};
