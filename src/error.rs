//! Crate error types

use std::sync::Arc;

use crate::hub::HubError;
use crate::live::LiveError;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for room, user and movie operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No live or persisted room with this id
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// No live or persisted user with this id
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No movie with this id in the room's list
    #[error("movie not found: {0}")]
    MovieNotFound(String),

    /// Hub or client is closed, or a bounded queue is full
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Live-stream channel failure
    #[error(transparent)]
    Live(#[from] LiveError),

    /// The credential was minted against an older room or user version
    #[error("credential version is stale")]
    StaleVersion,

    /// Password did not match
    #[error("invalid password")]
    InvalidPassword,

    /// The user lacks the permission for this action
    #[error("permission denied")]
    PermissionDenied,

    /// The room reached its viewer limit
    #[error("room is full")]
    RoomFull,

    /// Rejected input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage collaborator failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Message could not be encoded or decoded
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Error shared between callers of one coalesced load
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    /// Whether the error means the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::RoomNotFound(_) | Error::UserNotFound(_) | Error::MovieNotFound(_) => true,
            Error::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether the error means the handle is stale and must be re-resolved
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Hub(err) => err.is_closed(),
            Error::Live(LiveError::AppClosed(_)) => true,
            Error::Shared(inner) => inner.is_closed(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::RoomNotFound("r".into()).is_not_found());
        assert!(Error::Shared(Arc::new(Error::MovieNotFound("m".into()))).is_not_found());
        assert!(!Error::StaleVersion.is_not_found());
    }

    #[test]
    fn test_closed_classification() {
        assert!(Error::Hub(HubError::Closed).is_closed());
        assert!(Error::Hub(HubError::ClientClosed).is_closed());
        assert!(!Error::Hub(HubError::Full).is_closed());
        assert!(!Error::InvalidPassword.is_closed());
    }
}
