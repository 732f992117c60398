//! The dispatcher: filters, cooldowns, and fire-and-forget delivery.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use earshot_core::config::NotificationsConfig;

use crate::channel::{Channel, ChannelKind};

/// A notification-worthy broker event, already flattened for sinks.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub event_type: String,
    pub title: String,
    pub message: String,
    pub session_name: String,
    pub session_id: String,
    pub timestamp: f64,
    pub tags: Vec<String>,
    pub extra: Value,
}

impl NotifyEvent {
    pub fn new(event_type: &str, title: &str, message: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            session_name: String::new(),
            session_id: String::new(),
            timestamp: earshot_core::epoch_now(),
            tags: Vec::new(),
            extra: Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: &str, session_name: &str) -> Self {
        self.session_id = session_id.to_string();
        self.session_name = session_name.to_string();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

pub struct NotificationDispatcher {
    enabled: bool,
    cooldown: Duration,
    channels: Vec<Channel>,
    client: reqwest::Client,
    /// Last emit per (channel, event_type).
    last_sent: Mutex<HashMap<(String, String), Instant>>,
}

impl NotificationDispatcher {
    pub fn new(config: &NotificationsConfig) -> Self {
        Self {
            enabled: config.enabled,
            cooldown: Duration::from_secs(config.cooldown_secs),
            channels: config.channels.iter().map(Channel::from_config).collect(),
            client: reqwest::Client::new(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Dispatch to every accepting, non-cooled channel. Returns how many
    /// sends were spawned; a disabled dispatcher or empty channel list is a
    /// no-op.
    pub fn notify(&self, event: &NotifyEvent) -> usize {
        if !self.enabled || self.channels.is_empty() {
            return 0;
        }

        let mut spawned = 0;
        for channel in &self.channels {
            if !channel.accepts_event(&event.event_type) {
                continue;
            }
            if !self.cooldown_elapsed(channel, &event.event_type) {
                debug!(channel = %channel.name, event = %event.event_type, "notification cooled down");
                continue;
            }
            self.spawn_send(channel.clone(), event.clone());
            spawned += 1;
        }
        spawned
    }

    fn cooldown_elapsed(&self, channel: &Channel, event_type: &str) -> bool {
        let key = (channel.name.clone(), event_type.to_string());
        let mut last_sent = self.last_sent.lock().unwrap();
        let due = last_sent
            .get(&key)
            .map(|t| t.elapsed() >= self.cooldown)
            .unwrap_or(true);
        if due {
            last_sent.insert(key, Instant::now());
        }
        due
    }

    fn spawn_send(&self, channel: Channel, event: NotifyEvent) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let (body, extra_headers) = channel.render(&event);
            let method = Method::from_bytes(channel.method.as_bytes()).unwrap_or(Method::POST);

            let mut req = client.request(method, &channel.url);
            for (k, v) in &channel.headers {
                req = req.header(k, v);
            }
            for (k, v) in extra_headers {
                req = req.header(k, v);
            }
            req = match channel.kind {
                ChannelKind::Ntfy => req.body(body.as_str().unwrap_or_default().to_string()),
                _ => req.json(&body),
            };

            match req.timeout(Duration::from_secs(10)).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(channel = %channel.name, status = %resp.status(), "notification sink rejected event");
                }
                Ok(_) => {
                    debug!(channel = %channel.name, event = %event.event_type, "notification delivered");
                }
                Err(e) => {
                    warn!(channel = %channel.name, "notification send failed: {e}");
                }
            }
        });
    }
}
