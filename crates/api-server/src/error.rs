//! HTTP error mapping for the pipeline error taxonomy.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use faultline_core::PipelineError;
use serde::Serialize;
use tracing::error;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "validation_error",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: "service_unavailable",
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    /// 4xx for validation, 5xx for everything else. The full error is
    /// logged; clients only see a sanitized kind-level message.
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(message) => ApiError::validation(message),
            PipelineError::DegradedDependency(_) => {
                error!(error = %e, "Dependency degraded");
                ApiError::unavailable("dependency unavailable")
            }
            other => {
                error!(error = %other, "Request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: "internal_error",
                    message: "request failed".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        metrics::counter!("api.errors").increment(1);
        (
            self.status,
            Json(ErrorResponse {
                error: self.error.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}
