use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::error::EngineError;

/// Max lengths for user-provided string fields.
pub const MAX_URI: usize = 2048;
pub const MAX_NAME: usize = 256;
pub const MAX_SOURCE: usize = 1024 * 1024;
pub const MAX_SECRET: usize = 4096;

/// Validate that a string field does not exceed the given max length.
/// Returns `Some(Response)` with a 400 error if it does, `None` if OK.
pub fn validate_len(field: &str, value: &str, max: usize) -> Option<Response> {
    if value.len() > max {
        return Some(
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("{field} exceeds maximum length of {max} characters")
                })),
            )
                .into_response(),
        );
    }
    None
}

/// Map an engine error to its documented HTTP status. The full message is
/// logged; client bodies carry only a generic label per status class.
pub fn engine_error(context: &str, err: EngineError) -> Response {
    let status = err.status();
    error!(context = context, error = %err, "API error");
    let message = match status {
        StatusCode::NOT_FOUND => "Not found",
        StatusCode::CONFLICT => "Conflict",
        StatusCode::FORBIDDEN => "Forbidden",
        StatusCode::BAD_REQUEST => "Invalid request",
        StatusCode::GATEWAY_TIMEOUT => "Timed out",
        StatusCode::BAD_GATEWAY => "Upstream request blocked",
        _ => "Internal server error",
    };
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
