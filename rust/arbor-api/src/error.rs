//! Error taxonomy shared across the graph store, broker, and API layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Errors surfaced by the conversation core.
#[derive(Debug, thiserror::Error)]
pub enum ArborError {
    /// A referenced branch or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A batch or operation payload failed validation. Checked before any
    /// mutation is applied, so a bad batch never partially lands.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request would violate single-writer or version invariants.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The embedding or completion provider failed.
    #[error("upstream provider failure: {0}")]
    Upstream(String),

    /// A durable write failed. Fatal for the operation; nothing was
    /// partially committed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ArborError {
    /// Stable machine-readable code for the API error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::Upstream(_) => "upstream_failure",
            Self::Storage(_) => "storage_failure",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for ArborError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl IntoResponse for ArborError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Result alias for core operations.
pub type ArborResult<T> = Result<T, ArborError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ArborError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            ArborError::Validation("x".into()).code(),
            "validation_error"
        );
        assert_eq!(ArborError::Conflict("x".into()).code(), "conflict");
        assert_eq!(ArborError::Upstream("x".into()).code(), "upstream_failure");
        assert_eq!(ArborError::Storage("x".into()).code(), "storage_failure");
    }

    #[test]
    fn sqlite_errors_map_to_storage() {
        let err = ArborError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(err.code(), "storage_failure");
    }
}
