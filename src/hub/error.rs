//! Hub error types

/// Error type for hub and client operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The hub is closed or closing
    #[error("hub is closed")]
    Closed,
    /// The client is closed or its writer is gone
    #[error("client is closed")]
    ClientClosed,
    /// A bounded queue has no room left
    #[error("queue is full")]
    Full,
}

impl HubError {
    /// Whether the handle that produced this error is stale
    pub fn is_closed(&self) -> bool {
        matches!(self, HubError::Closed | HubError::ClientClosed)
    }
}
