// HTTP error mapping.
//
// Every error leaves the API as a structured body {error_kind, detail}.
// Conflicts map to 503 so callers know a retry with jitter is worthwhile;
// invalid transitions map to 409 and must not be retried.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jobmon_core::JobmonError;
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError(pub JobmonError);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    detail: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            JobmonError::InvalidTransition { .. } => StatusCode::CONFLICT,
            JobmonError::NotFound(_) => StatusCode::NOT_FOUND,
            JobmonError::Conflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            JobmonError::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            JobmonError::Unauthenticated => StatusCode::UNAUTHORIZED,
            JobmonError::SchemaViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            JobmonError::Integration(_) => StatusCode::BAD_GATEWAY,
            JobmonError::Configuration(_) | JobmonError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Database faults get full traces; client mistakes stay quiet.
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }

        let body = ErrorBody {
            error_kind: self.0.kind_str(),
            detail: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JobmonError> for ApiError {
    fn from(e: JobmonError) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kinds() {
        assert_eq!(
            ApiError(JobmonError::conflict("x")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(JobmonError::not_found("x")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(JobmonError::InvalidTransition {
                entity: "task",
                id: 1,
                from: "D".into(),
                to: "R".into()
            })
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(JobmonError::Unauthenticated).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
