//! Error taxonomy shared by every server component.

use axum::http::StatusCode;
use shared::tile::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication required: {0}")]
    Authentication(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type GridResult<T> = Result<T, GridError>;

impl GridError {
    pub fn validation(message: impl Into<String>) -> Self {
        GridError::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GridError::Validation(_) => StatusCode::BAD_REQUEST,
            GridError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GridError::NotFound(_) => StatusCode::NOT_FOUND,
            GridError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            GridError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<CodecError> for GridError {
    fn from(e: CodecError) -> Self {
        GridError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(e: std::io::Error) -> Self {
        GridError::Internal(e.to_string())
    }
}

impl From<bincode::Error> for GridError {
    fn from(e: bincode::Error) -> Self {
        GridError::Internal(format!("snapshot encoding: {}", e))
    }
}
