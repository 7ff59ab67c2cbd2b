use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error carried as a short machine code plus a human message.
/// The HTTP boundary maps codes to statuses from the single table below;
/// bodies render as `{"detail":{"error":code,"message":message}}` on both
/// the control plane and the runner.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{message}")]
    Unauthorized { code: &'static str, message: String },
    #[error("{message}")]
    Forbidden { code: &'static str, message: String },
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("rate limit exceeded")]
    RateLimited,
    /// Error surfaced by the runner; status and code pass through.
    #[error("{message}")]
    Runner {
        status: u16,
        code: String,
        message: String,
    },
    /// Runner-side runtime manager failure, mapped by `runtime_status_for`.
    #[error("{message}")]
    Runtime { code: &'static str, message: String },
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Forbidden {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        AppError::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            AppError::Db(_) => "database_error",
            AppError::Unauthorized { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::BadRequest { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Runtime { code, .. } => code,
            AppError::RateLimited => "rate_limit_exceeded",
            AppError::Runner { code, .. } => code,
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Runner { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Runtime { code, .. } => runtime_status_for(code),
            AppError::Db(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Status table for runtime manager codes.
pub fn runtime_status_for(code: &str) -> StatusCode {
    match code {
        "invalid_tenant_id" | "invalid_tenant_path" | "invalid_config_item" | "unsafe_path" => {
            StatusCode::BAD_REQUEST
        }
        "tenant_not_found" | "compose_missing" => StatusCode::NOT_FOUND,
        "docker_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "docker_command_failed" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, code = %self.code(), "request failed");
        }
        let body = json!({
            "detail": {
                "error": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_codes_map_to_expected_statuses() {
        assert_eq!(
            runtime_status_for("invalid_tenant_id"),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(runtime_status_for("compose_missing"), StatusCode::NOT_FOUND);
        assert_eq!(
            runtime_status_for("docker_unavailable"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            runtime_status_for("docker_command_failed"),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            runtime_status_for("template_missing"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn runner_error_passes_status_through() {
        let err = AppError::Runner {
            status: 503,
            code: "docker_unavailable".into(),
            message: "engine down".into(),
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "docker_unavailable");
    }
}
