use rtcast_router::RouterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("rtmp ingest error: {0}")]
    Rtmp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
