//! Error types for review operations and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// Everything that can go wrong while loading or editing a review session.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    /// An upload could not be parsed at all.
    #[error("could not read {filename}: {reason}")]
    FileFormat { filename: String, reason: String },

    /// The upload parsed but is missing required keys or has the wrong shape.
    #[error("schema error: {0}")]
    Schema(String),

    /// A value could not be coerced to the field's declared type.
    #[error("field '{field}' expects {expected}, got {value}")]
    Validation {
        field: String,
        expected: String,
        value: String,
    },

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{0}' already exists")]
    DuplicateField(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// An operation needs an input that has not been uploaded yet.
    #[error("no {0} has been uploaded to this session")]
    MissingInput(&'static str),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ReviewError {
    pub fn file_format(filename: impl Into<String>, reason: impl ToString) -> Self {
        Self::FileFormat {
            filename: filename.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable kind, used as the `error` key in responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileFormat { .. } => "file_format",
            Self::Schema(_) => "schema",
            Self::Validation { .. } => "validation",
            Self::UnknownField(_) => "unknown_field",
            Self::DuplicateField(_) => "duplicate_field",
            Self::SessionNotFound(_) => "session_not_found",
            Self::MissingInput(_) => "missing_input",
            Self::BadRequest(_) => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::FileFormat { .. } | Self::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Validation { .. } | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownField(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateField(_) | Self::MissingInput(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!("Request rejected ({}): {}", self.kind(), self);
        let body = json!({ "error": self.kind(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type Result<T, E = ReviewError> = std::result::Result<T, E>;
