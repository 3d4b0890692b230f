use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Attach error: {0}")]
    Attach(String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Body unavailable: {0}")]
    BodyUnavailable(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Response filter error: {0}")]
    Filter(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn attach<T: fmt::Display>(msg: T) -> Self {
        Error::Attach(msg.to_string())
    }

    pub fn host<T: fmt::Display>(msg: T) -> Self {
        Error::Host(msg.to_string())
    }

    pub fn body_unavailable<T: fmt::Display>(msg: T) -> Self {
        Error::BodyUnavailable(msg.to_string())
    }

    pub fn malformed_event<T: fmt::Display>(msg: T) -> Self {
        Error::MalformedEvent(msg.to_string())
    }

    pub fn filter<T: fmt::Display>(msg: T) -> Self {
        Error::Filter(msg.to_string())
    }

    pub fn replay<T: fmt::Display>(msg: T) -> Self {
        Error::Replay(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }
}
