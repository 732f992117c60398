use std::sync::{Arc, RwLock};

use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use earshot_broker::ToolDispatcher;
use earshot_core::config::EarshotConfig;
use earshot_core::event::EventBus;
use earshot_core::uistate::UiState;
use earshot_proc::Supervisor;
use earshot_sessions::SessionManager;
use earshot_tts::TtsEngine;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: Arc<RwLock<EarshotConfig>>,
    pub bus: Arc<EventBus>,
    pub manager: Arc<SessionManager>,
    pub tts: Arc<TtsEngine>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub supervisor: Arc<Supervisor>,
    pub uistate: Arc<UiState>,
    pub started_at: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<EarshotConfig>>,
        bus: Arc<EventBus>,
        manager: Arc<SessionManager>,
        tts: Arc<TtsEngine>,
        dispatcher: Arc<ToolDispatcher>,
        supervisor: Arc<Supervisor>,
        uistate: Arc<UiState>,
    ) -> Self {
        Self {
            config,
            bus,
            manager,
            tts,
            dispatcher,
            supervisor,
            uistate,
            started_at: std::time::Instant::now(),
        }
    }
}

/// Assemble the full Axum router. Every response (including OPTIONS
/// preflights) carries permissive CORS headers; preflights answer 204.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(crate::http::health::health_handler))
        .route("/api/sessions", get(crate::http::sessions::list_handler))
        .route(
            "/api/sessions/{id}/message",
            post(crate::http::message::session_message_handler),
        )
        .route(
            "/api/message",
            post(crate::http::message::broadcast_message_handler),
        )
        .route("/api/events", get(crate::http::events::sse_handler))
        .route(
            "/api/diagnostics",
            get(crate::http::diag::diagnostics_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(preflight_no_content))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// `CorsLayer` answers preflights itself with 200; the wire contract is a
/// bodyless 204 with the same headers, so rewrite the status on the way out.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}
