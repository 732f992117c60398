//! Long-lived SSE stream of frontend events.
//!
//! Each connection owns one bounded bus subscription; the bus drops events
//! for this subscriber only if the socket stalls, and disconnect is detected
//! when the stream is dropped.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde_json::json;
use tracing::debug;

use crate::app::AppState;

/// GET /api/events — `connected` first, then every published event until the
/// client goes away.
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut sub = state.bus.subscribe();
    debug!(subscriber = sub.id, "sse client connected");

    let stream = async_stream::stream! {
        let connected = json!({
            "data": {"subscriber": sub.id},
            "session_id": "",
            "timestamp": earshot_core::epoch_now(),
        });
        yield Ok(Event::default().event("connected").data(connected.to_string()));

        while let Some(ev) = sub.rx.recv().await {
            let body = json!({
                "data": ev.data,
                "session_id": ev.session_id,
                "timestamp": ev.timestamp,
            });
            yield Ok(Event::default().event(ev.event_type).data(body.to_string()));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
