pub mod diag;
pub mod events;
pub mod health;
pub mod message;
pub mod sessions;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// Uniform error body: `{"error": "<msg>"}` with an appropriate status.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn error_response(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: msg.to_string(),
        }),
    )
}
