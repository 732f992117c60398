//! Frontend event model and the in-process pub/sub bus.
//!
//! Every state change in the broker is published as a [`FrontendEvent`] and
//! fanned out to subscribers: the embedded UI and any number of HTTP SSE
//! clients. Publishing never blocks: each subscriber owns a bounded queue
//! and a slow consumer only loses its own events.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

/// Bounded queue depth per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// One event on the frontend bus.
#[derive(Debug, Clone, Serialize)]
pub struct FrontendEvent {
    pub event_type: String,
    pub data: Value,
    pub session_id: String,
    pub timestamp: f64,
}

impl FrontendEvent {
    pub fn new(event_type: &str, data: Value, session_id: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            session_id: session_id.to_string(),
            timestamp: crate::epoch_now(),
        }
    }

    /// SSE wire form: `event: <type>\ndata: <JSON>\n\n` where the JSON body
    /// carries `data`, `session_id`, and `timestamp`.
    pub fn to_sse(&self) -> String {
        let body = json!({
            "data": self.data,
            "session_id": self.session_id,
            "timestamp": self.timestamp,
        });
        format!("event: {}\ndata: {}\n\n", self.event_type, body)
    }
}

/// Handle returned by [`EventBus::subscribe`]; dropping the receiver is
/// enough; the bus prunes closed queues on the next publish.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<FrontendEvent>,
}

struct Subscriber {
    tx: mpsc::Sender<FrontendEvent>,
    dropped: AtomicU64,
}

/// In-process pub/sub with per-subscriber bounded queues.
pub struct EventBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Publish to every subscriber. Never blocks: a full queue drops the
    /// event for that subscriber only; a closed queue unsubscribes it.
    pub fn publish(&self, event: FrontendEvent) {
        let mut dead: Vec<u64> = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let n = entry.value().dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(subscriber = *entry.key(), dropped = n, event = %event.event_type,
                        "subscriber queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events dropped for a subscriber so far (slow-client observability).
    pub fn dropped_count(&self, id: u64) -> Option<u64> {
        self.subscribers
            .get(&id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    // --- emit helpers ------------------------------------------------------

    pub fn emit_choices_presented(&self, session_id: &str, preamble: &str, choices: Value) {
        self.publish(FrontendEvent::new(
            "choices_presented",
            json!({"preamble": preamble, "choices": choices}),
            session_id,
        ));
    }

    pub fn emit_speech_requested(&self, session_id: &str, text: &str, blocking: bool) {
        self.publish(FrontendEvent::new(
            "speech_requested",
            json!({"text": text, "blocking": blocking}),
            session_id,
        ));
    }

    pub fn emit_session_created(&self, session_id: &str, name: &str) {
        self.publish(FrontendEvent::new(
            "session_created",
            json!({"name": name}),
            session_id,
        ));
    }

    pub fn emit_session_removed(&self, session_id: &str, name: &str) {
        self.publish(FrontendEvent::new(
            "session_removed",
            json!({"name": name}),
            session_id,
        ));
    }

    pub fn emit_selection_made(&self, session_id: &str, selected: &str) {
        self.publish(FrontendEvent::new(
            "selection_made",
            json!({"selected": selected}),
            session_id,
        ));
    }

    pub fn emit_recording_state(&self, session_id: &str, recording: bool) {
        self.publish(FrontendEvent::new(
            "recording_state",
            json!({"recording": recording}),
            session_id,
        ));
    }

    pub fn emit_settings_changed(&self, settings: Value) {
        self.publish(FrontendEvent::new("settings_changed", settings, ""));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_wire_format() {
        let ev = FrontendEvent {
            event_type: "selection_made".into(),
            data: json!({"selected": "y"}),
            session_id: "a".into(),
            timestamp: 1234.5,
        };
        let sse = ev.to_sse();
        assert!(sse.starts_with("event: selection_made\ndata: "));
        assert!(sse.ends_with("\n\n"));

        let body: Value =
            serde_json::from_str(sse.trim().strip_prefix("event: selection_made\ndata: ").unwrap())
                .unwrap();
        assert_eq!(body["session_id"], "a");
        assert_eq!(body["data"]["selected"], "y");
        assert_eq!(body["timestamp"], 1234.5);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit_session_created("s1", "Agent");

        let ev = sub.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "session_created");
        assert_eq!(ev.session_id, "s1");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let sub = bus.subscribe();

        // Never drain; overfill the bounded queue.
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(FrontendEvent::new("tick", json!({"i": i}), "s"));
        }

        assert_eq!(bus.dropped_count(sub.id), Some(10));
        // The publisher itself never stalled; we got here.
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        drop(sub.rx);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(FrontendEvent::new("tick", json!({}), ""));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_queue() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn emit_helpers_shape_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.emit_choices_presented("s", "Pick one", json!([{"label": "a"}]));
        bus.emit_speech_requested("s", "hello", true);
        bus.emit_selection_made("s", "a");
        bus.emit_recording_state("s", true);
        bus.emit_settings_changed(json!({"tts_voice": "nova"}));

        let ev = sub.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "choices_presented");
        assert_eq!(ev.data["preamble"], "Pick one");

        let ev = sub.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "speech_requested");
        assert_eq!(ev.data["blocking"], true);

        let ev = sub.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "selection_made");

        let ev = sub.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "recording_state");
        assert_eq!(ev.data["recording"], true);

        let ev = sub.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "settings_changed");
        assert_eq!(ev.session_id, "");
    }

    #[tokio::test]
    async fn publish_order_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(FrontendEvent::new("tick", json!({"i": i}), ""));
        }
        for i in 0..5 {
            let ev = sub.rx.recv().await.unwrap();
            assert_eq!(ev.data["i"], i);
        }
    }
}
