//! HTTP error type shared by all handlers.

use std::fmt;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("{0}")]
    NotFound(String),

    /// Every upstream provider failed and there is no degraded answer.
    #[error("{error}")]
    Upstream {
        error: &'static str,
        details: Vec<String>,
    },

    #[error("{error}")]
    Internal {
        error: &'static str,
        details: Vec<String>,
    },
}

impl ApiError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn upstream(error: &'static str, cause: impl fmt::Display) -> Self {
        ApiError::Upstream {
            error,
            details: vec![cause.to_string()],
        }
    }

    /// Log `cause` and wrap it under a user facing `error` title.
    pub fn internal(error: &'static str, cause: impl fmt::Display) -> Self {
        let cause = cause.to_string();
        error!("{}: {}", error, cause);
        ApiError::Internal {
            error,
            details: vec![cause],
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::field("body", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Validation(details) => json!({
                "success": false,
                "error": self.to_string(),
                "details": details,
            }),
            ApiError::NotFound(_) => json!({
                "success": false,
                "error": self.to_string(),
            }),
            ApiError::Upstream { error, details } | ApiError::Internal { error, details } => json!({
                "success": false,
                "error": error,
                "details": details,
            }),
        };
        (status, Json(body)).into_response()
    }
}
