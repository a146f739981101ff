//! Error types shared by the queue, the scheduler and the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum HandoffError {
    /// Malformed identifiers or missing required fields. Nothing was written.
    #[error("{0}")]
    Validation(String),

    /// Role or team membership does not allow the operation.
    #[error("{0}")]
    Forbidden(String),

    /// Duplicate active transfer, or the transfer left the state the
    /// operation requires.
    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Outbound customer message could not be delivered.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

pub type Result<T, E = HandoffError> = std::result::Result<T, E>;

impl From<rusqlite::Error> for HandoffError {
    fn from(e: rusqlite::Error) -> Self {
        HandoffError::Storage(StorageError::from(e))
    }
}

impl HandoffError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HandoffError::Validation(_) => StatusCode::BAD_REQUEST,
            HandoffError::Forbidden(_) => StatusCode::FORBIDDEN,
            HandoffError::Conflict(_) => StatusCode::CONFLICT,
            HandoffError::NotFound(_) => StatusCode::NOT_FOUND,
            HandoffError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HandoffError::Delivery(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for HandoffError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
