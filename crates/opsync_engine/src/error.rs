//! Error types for the sync engine.

use opsync_protocol::ProtocolError;
use opsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the batch.
    #[error("server error: {0}")]
    ServerError(String),

    /// Local queue or version store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required collaborator was not supplied.
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    /// A pushed operation was not answered in time.
    #[error("operation {0} timed out")]
    Timeout(String),

    /// The push channel closed while operations were in flight.
    #[error("push channel closed")]
    ChannelClosed,

    /// An operation with the same id is already in flight.
    #[error("operation {0} is already in flight")]
    DuplicateOperation(String),

    /// The server rejected a single pushed operation.
    #[error("operation {operation_id} rejected: {message}")]
    Rejected {
        /// Correlation id.
        operation_id: String,
        /// Server message.
        message: String,
    },

    /// Catch-up could not bring the client level with the server.
    #[error("catch-up failed: {0}")]
    CatchUpFailed(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout(_)
            | SyncError::ChannelClosed
            | SyncError::ServerError(_)
            | SyncError::Rejected { .. }
            | SyncError::CatchUpFailed(_) => !self.is_authentication_failure(),
            SyncError::Storage(StorageError::Io(_) | StorageError::Locked(_)) => true,
            _ => false,
        }
    }

    /// Returns true if this error means the client must sign in again.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            SyncError::AuthenticationFailed(_) => true,
            SyncError::InvalidConfig(_) | SyncError::MissingDependency(_) => false,
            other => message_indicates_auth(&other.to_string()),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Returns true if an error message signals an unauthorized status.
///
/// Matches whole words only, so ids that happen to contain `401` do not
/// count.
pub fn message_indicates_auth(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unauthorized")
        || lower.contains("unauthenticated")
        || lower.contains("forbidden")
        || lower.contains("authentication")
        || lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "401" || word == "403")
}
