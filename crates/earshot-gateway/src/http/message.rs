use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use earshot_core::event::FrontendEvent;

use crate::app::AppState;
use crate::http::{error_response, ErrorBody};

#[derive(Deserialize)]
pub struct MessageBody {
    pub text: String,
}

#[derive(Deserialize)]
pub struct BroadcastBody {
    pub text: String,
    /// "all" or "active".
    #[serde(default = "default_target")]
    pub target: String,
}

fn default_target() -> String {
    "active".to_string()
}

/// POST /api/sessions/{id}/message — queue a message for one agent.
pub async fn session_message_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorBody>)> {
    if body.text.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "empty message"));
    }
    let Some(session) = state.manager.get(&id) else {
        return Err(error_response(StatusCode::NOT_FOUND, "session not found"));
    };

    let pending = session.queue_message(&body.text);
    state.bus.publish(FrontendEvent::new(
        "message_queued",
        json!({"text": body.text, "pending": pending}),
        &id,
    ));
    Ok(Json(json!({"pending": pending})))
}

/// POST /api/message — fan a message out to all sessions or the focused one.
pub async fn broadcast_message_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BroadcastBody>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorBody>)> {
    if body.text.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "empty message"));
    }

    let targets = match body.target.as_str() {
        "all" => state.manager.all_sessions(),
        "active" => state.manager.focused().into_iter().collect(),
        other => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("unknown target '{other}'"),
            ))
        }
    };

    for session in &targets {
        let pending = session.queue_message(&body.text);
        state.bus.publish(FrontendEvent::new(
            "message_queued",
            json!({"text": body.text, "pending": pending}),
            &session.session_id,
        ));
    }
    Ok(Json(json!({"count": targets.len()})))
}
