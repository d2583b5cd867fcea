use thiserror::Error;

/// Failure taxonomy for the sync engine. Nothing here is fatal to the
/// process; every variant degrades to "stays local, retry later" except
/// the caller-input rejections.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("message has no text and no rich content")]
    EmptyMessage,
    #[error("no room is open")]
    NoActiveRoom,
    #[error("could not resolve conversation identity: {reason}")]
    IdentityResolution { reason: String },
    #[error("message {0} not found in the active room")]
    UnknownMessage(String),
}

impl SyncError {
    pub fn identity(reason: impl Into<String>) -> Self {
        Self::IdentityResolution {
            reason: reason.into(),
        }
    }
}
