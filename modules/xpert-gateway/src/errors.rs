use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Top-level error taxonomy for the gateway. Every layer (store, prober,
/// aggregator, policy, traffic, admin log) maps its failures into one of
/// these variants before it reaches the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("policy denied")]
    PolicyDeny,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::PolicyDeny => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Timeout => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Database(_)
            | GatewayError::Io(_)
            | GatewayError::Serde(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::PolicyDeny => "policy_deny",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Timeout => "timeout",
            GatewayError::Database(_) => "database_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Serde(_) => "serde_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Policy decisions never log a stack trace; everything else does.
        if !matches!(self, GatewayError::PolicyDeny) {
            tracing::error!(kind = self.kind(), "{}", self);
        }
        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_deny_maps_to_403() {
        assert_eq!(GatewayError::PolicyDeny.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            GatewayError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn validation_maps_to_400() {
        assert_eq!(
            GatewayError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn conflict_maps_to_409() {
        assert_eq!(
            GatewayError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn timeout_maps_to_408() {
        assert_eq!(GatewayError::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn database_maps_to_500() {
        let err = GatewayError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn io_maps_to_500() {
        let err = GatewayError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn serde_maps_to_500() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = GatewayError::from(json_err);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_maps_to_500() {
        assert_eq!(
            GatewayError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
