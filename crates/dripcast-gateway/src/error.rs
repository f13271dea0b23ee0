//! HTTP mapping for [`DripError`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dripcast_core::error::DripError;

/// Handler error: a domain error rendered as `{ok: false, kind, error}`.
#[derive(Debug)]
pub struct ApiError(pub DripError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DripError::Validation { .. } => StatusCode::BAD_REQUEST,
            DripError::NotFound(_) => StatusCode::NOT_FOUND,
            DripError::StoreBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DripError> for ApiError {
    fn from(e: DripError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(kind = self.0.kind(), "request failed: {}", self.0);
            "An internal error occurred".to_string()
        } else {
            self.0.to_string()
        };
        let body = Json(serde_json::json!({
            "ok": false,
            "kind": self.0.kind(),
            "error": message,
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DripError::validation("track", "bad"), StatusCode::BAD_REQUEST),
            (DripError::NotFound("template free#3".into()), StatusCode::NOT_FOUND),
            (DripError::StoreBusy("pool".into()), StatusCode::SERVICE_UNAVAILABLE),
            (DripError::StoreIntegrity("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
