//! Error handling for the Redfire ACS

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed SOAP envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Malformed Inform: {0}")]
    MalformedInform(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Store conflict: {0}")]
    StoreConflict(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Invalid task payload: {0}")]
    InvalidTaskPayload(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed_envelope<S: Into<String>>(msg: S) -> Self {
        Self::MalformedEnvelope(msg.into())
    }

    pub fn malformed_inform<S: Into<String>>(msg: S) -> Self {
        Self::MalformedInform(msg.into())
    }

    pub fn store_conflict<S: Into<String>>(msg: S) -> Self {
        Self::StoreConflict(msg.into())
    }

    pub fn unknown_device<S: Into<String>>(msg: S) -> Self {
        Self::UnknownDevice(msg.into())
    }

    pub fn invalid_task<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskPayload(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}
