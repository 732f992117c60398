use axum::{extract::State, Json};
use serde_json::Value;
use std::sync::Arc;

use crate::app::AppState;

/// GET /api/diagnostics — PID/port liveness for the local broker process.
pub async fn diagnostics_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (address, pid_file) = {
        let config = state.config.read().unwrap();
        (
            format!("{}:{}", config.gateway.bind, config.gateway.port),
            config.persistence.pid_file.clone(),
        )
    };
    let health = earshot_core::diag::proxy_health(&address, std::path::Path::new(&pid_file));
    Json(serde_json::to_value(health).unwrap_or(Value::Null))
}
