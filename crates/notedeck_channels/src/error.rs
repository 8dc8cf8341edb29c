use std::io;

/// Channel related errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] enostr::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("generic error: {0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("at least one hashtag is required")]
    EmptyHashtags,
}

/// Raised when building a relay filter from an invalid channel. Channel
/// validation should make this unreachable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("no hashtags to filter on")]
    EmptyHashtags,
}

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Error::Channel(ChannelError::NotFound(id.into()))
    }
}
