use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChuzziError {
    /// Missing or invalid credentials/configuration. Never retried.
    #[error("Config error: {0}")]
    Config(String),

    /// Audio device access was denied or is unavailable.
    #[error("Permission error: {0}")]
    Permission(String),

    /// Transport dropped, closed abnormally, or could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote refused the credentials during the handshake.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// The outbound channel is already closing or closed.
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Send error: {0}")]
    Send(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChuzziError {
    /// Whether the session manager should schedule a reconnect for this error.
    ///
    /// Credential and configuration errors end the session; other transport
    /// failures are retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Config(_) | Self::Rejected(_) | Self::Permission(_) | Self::ChannelClosed
        )
    }

    /// Send raced with teardown; callers swallow this.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, ChuzziError>;
