//! Shared handlers and error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use stategraph_core::Error;

use super::json_error;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

pub(crate) fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidArgument(_) | Error::InvalidContent(_) | Error::ValidationFailed(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) | Error::LockMismatch { .. } => StatusCode::CONFLICT,
        Error::LockConflict(_) => StatusCode::LOCKED,
        Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Engine error as an HTTP response.
///
/// Lock conflicts answer with the holder's `LockInfo` as the whole body,
/// which is what Terraform reads to report who holds the lock.
pub(crate) struct ApiError(pub(crate) Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        match self.0 {
            Error::LockConflict(holder) => (status, Json(holder)).into_response(),
            Error::LockMismatch {
                message,
                held: Some(held),
            } => {
                let body = serde_json::json!({
                    "error": message,
                    "code": "lock_mismatch",
                    "lock": held,
                });
                (status, Json(body)).into_response()
            }
            Error::Storage(message) => {
                tracing::error!(error = %message, "storage failure");
                let body = serde_json::json!({"error": "storage error", "code": "storage"});
                (status, Json(body)).into_response()
            }
            err => {
                let body = serde_json::json!({"error": err.to_string(), "code": err.kind()});
                (status, Json(body)).into_response()
            }
        }
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use stategraph_storage::LockInfo;

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::InvalidContent("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::AlreadyExists("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::LockConflict(LockInfo::default())),
            StatusCode::LOCKED
        );
        assert_eq!(
            status_for(&Error::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn lock_conflict_response_is_423() {
        let holder = LockInfo {
            id: "l1".into(),
            ..Default::default()
        };
        let response = ApiError(Error::LockConflict(holder)).into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
    }
}
