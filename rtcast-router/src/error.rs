use crate::types::StreamId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("router already exists for stream {0}")]
    RouterExists(StreamId),

    #[error("router for stream {0} is stopped")]
    RouterStopped(StreamId),

    #[error("no publisher bound for stream {0}")]
    NoPublisher(StreamId),

    #[error("publisher already bound for stream {0}")]
    PublisherExists(StreamId),

    #[error("offer carries no media stream")]
    NoStreamInfo,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("ingress error: {0}")]
    Ingress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RouterResult<T> = Result<T, RouterError>;

impl From<reqwest::Error> for RouterError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
