//! Maps `EchoNetError` onto HTTP status codes, so handlers can propagate
//! `?` straight through and let this one `IntoResponse` impl pick the
//! status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use echonet_core::EchoNetError;
use serde_json::json;

pub struct AppError(pub EchoNetError);

impl From<EchoNetError> for AppError {
    fn from(err: EchoNetError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EchoNetError::NotFound(_) => StatusCode::NOT_FOUND,
            EchoNetError::InvalidConfig(_) | EchoNetError::InvalidMode(_) => StatusCode::BAD_REQUEST,
            EchoNetError::SchemaVersion { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
