use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /api/sessions — all sessions in tab order.
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .manager
        .infos()
        .into_iter()
        .map(|info| {
            json!({
                "id": info.id,
                "name": info.name,
                "active": info.active,
                "registered": info.registered,
                "cwd": info.cwd,
                "hostname": info.hostname,
            })
        })
        .collect();
    Json(json!({"sessions": sessions}))
}
