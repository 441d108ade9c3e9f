//! Live-stream error types

/// Error type for live app and channel operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    /// The room's live app has been closed
    #[error("live app closed: {0}")]
    AppClosed(String),

    /// No live app registered under this name
    #[error("live app not found: {0}")]
    AppNotFound(String),

    /// No channel with this name in the app
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The channel exists but nobody is publishing
    #[error("channel not active: {0}")]
    ChannelNotActive(String),

    /// The channel already has a publisher
    #[error("channel already has a publisher: {0}")]
    AlreadyPublishing(String),

    /// The caller is not the channel's publisher
    #[error("publisher id mismatch")]
    PublisherMismatch,
}
