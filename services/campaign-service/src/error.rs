use axum::http::StatusCode;
use thiserror::Error;

use crate::models::ErrorResponse;

/// Failure taxonomy for the engine. Transport failures are recorded on the
/// job they belong to and never abort a batch; store failures do.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("delivery failed: {0}")]
    Transport(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Transport(_) => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Validation(_) => "validation_failed",
            EngineError::Transport(_) => "transport_failed",
            EngineError::Store(_) => "store_error",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}
