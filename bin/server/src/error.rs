//! Error types for the HTTP surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tally_ai::AgentError;

/// Errors returned by route handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The request was malformed or empty.
    Validation { reason: String },
    /// A storage operation failed.
    Database { details: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "invalid request: {reason}"),
            Self::Database { details } => write!(f, "database error: {details}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Builds a database error from any displayable cause.
    pub fn database(cause: impl fmt::Display) -> Self {
        Self::Database {
            details: cause.to_string(),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Validation { reason } => Self::Validation { reason },
            other => Self::Database {
                details: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation { reason } => (StatusCode::BAD_REQUEST, reason.as_str()),
            Self::Database { details } => {
                tracing::error!(error = %details, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ApiError::from(AgentError::Validation {
            reason: "empty".to_string(),
        });
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn database_errors_are_hidden() {
        let response = ApiError::database("connection refused").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
