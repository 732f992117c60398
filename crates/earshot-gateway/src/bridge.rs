//! Bus → notification bridge: forwards alert-worthy frontend events to the
//! configured notification sinks, keeping delivery off the publish path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use earshot_core::event::{EventBus, FrontendEvent};
use earshot_notify::{NotificationDispatcher, NotifyEvent};

/// Event types worth pushing to the operator's phone.
const ALERT_EVENTS: &[&str] = &[
    "health_warning",
    "health_unresponsive",
    "session_removed",
    "choices_timeout",
    "error",
];

pub fn spawn(
    bus: Arc<EventBus>,
    notifier: Arc<NotificationDispatcher>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut sub = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = sub.rx.recv() => {
                    let Some(event) = event else { break };
                    if ALERT_EVENTS.contains(&event.event_type.as_str()) {
                        let spawned = notifier.notify(&to_notify_event(&event));
                        debug!(event = %event.event_type, spawned, "alert forwarded to sinks");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

fn to_notify_event(event: &FrontendEvent) -> NotifyEvent {
    let name = event
        .data
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(&event.session_id);

    let (title, message, tags): (String, String, &[&str]) = match event.event_type.as_str() {
        "health_warning" => (
            format!("{name} stalled"),
            "No tool call for over 5 minutes".to_string(),
            &["warning"],
        ),
        "health_unresponsive" => (
            format!("{name} unresponsive"),
            "No tool call for over 10 minutes".to_string(),
            &["rotating_light"],
        ),
        "session_removed" => (
            format!("{name} removed"),
            "The session was cleaned up".to_string(),
            &["wastebasket"],
        ),
        "choices_timeout" => (
            format!("{name} gave up waiting"),
            "A question timed out without an answer".to_string(),
            &["hourglass"],
        ),
        _ => (
            format!("{name}: {}", event.event_type),
            event.data.to_string(),
            &["bell"],
        ),
    };

    NotifyEvent {
        event_type: event.event_type.clone(),
        title,
        message,
        session_name: name.to_string(),
        session_id: event.session_id.clone(),
        timestamp: event.timestamp,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        extra: event.data.clone(),
    }
}
