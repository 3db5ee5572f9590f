use pubsub::TransportError;
use shared::error::{ApiError, ApiException, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("room {0} is not mounted")]
    NotMounted(i64),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("broadcast event carries no message id")]
    MissingEventId,
    #[error("failed to decode broadcast payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        SyncError::Api(value.into())
    }
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::NotSignedIn => ErrorCode::Unauthorized,
            SyncError::NotMounted(_) => ErrorCode::NotFound,
            SyncError::Validation(_) | SyncError::MissingEventId | SyncError::Decode(_) => {
                ErrorCode::Validation
            }
            SyncError::Api(api) => api.code,
            SyncError::Transport(_) => ErrorCode::Unavailable,
        }
    }
}
