use shared::error::ApiException;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no conversation selected")]
    NoContext,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("conversation context changed while the operation was in flight")]
    Superseded,
    #[error("no confirmation from the server")]
    Unconfirmed,
    #[error("backend error: {0}")]
    Api(#[from] ApiException),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Maps a collaborator failure, keeping structured backend errors intact.
    pub fn from_collaborator(err: anyhow::Error) -> Self {
        match err.downcast::<ApiException>() {
            Ok(api) => SyncError::Api(api),
            Err(other) => SyncError::Transport(format!("{other:#}")),
        }
    }
}
