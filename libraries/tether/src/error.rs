use crate::blob::BlobError;
use crate::config::ConfigError;
use crate::data_model::{LocalSeq, PathError};
use crate::journal::JournalError;
use crate::snapshot::SnapshotError;

/// Everything the engine can surface to an observer or a write handle.
///
/// Cloneable because one failure often fans out to several observers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("write {seq} rejected by remote store: {reason}")]
    ConflictRejected { seq: LocalSeq, reason: String },

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("request timed out")]
    Timeout,

    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token rejected: {0}")]
    Invalid(String),

    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single remote-store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Transport(e) => SyncError::Transport(e),
            RemoteError::Auth(e) => SyncError::Auth(e),
        }
    }
}
