//! Notification channel model and per-kind payload serialisation.

use std::collections::HashMap;

use serde_json::{json, Value};

use earshot_core::config::ChannelConfig;

use crate::dispatch::NotifyEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Ntfy,
    Slack,
    Discord,
    Webhook,
}

impl ChannelKind {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ntfy" => Self::Ntfy,
            "slack" => Self::Slack,
            "discord" => Self::Discord,
            _ => Self::Webhook,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub kind: ChannelKind,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    /// Accepted event types; "all" matches everything.
    pub events: Vec<String>,
    pub priority: u8,
}

impl Channel {
    pub fn from_config(cfg: &ChannelConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            kind: ChannelKind::parse(&cfg.kind),
            url: cfg.url.clone(),
            method: cfg.method.clone(),
            headers: cfg.headers.clone(),
            events: cfg.events.clone(),
            priority: cfg.priority,
        }
    }

    pub fn accepts_event(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == "all" || e == event_type)
    }

    /// Body and extra headers for this channel's wire format. ntfy posts the
    /// plain text body with metadata headers; the rest post JSON.
    pub fn render(&self, event: &NotifyEvent) -> (Value, Vec<(String, String)>) {
        match self.kind {
            ChannelKind::Ntfy => (
                Value::String(event.message.clone()),
                vec![
                    ("Title".to_string(), event.title.clone()),
                    ("Priority".to_string(), self.priority.to_string()),
                    ("Tags".to_string(), event.tags.join(",")),
                ],
            ),
            ChannelKind::Slack => (
                json!({
                    "text": format!("{}: {}", event.title, event.message),
                    "blocks": [
                        {
                            "type": "section",
                            "text": {
                                "type": "mrkdwn",
                                "text": format!("*{}*\n{}", event.title, event.message),
                            }
                        }
                    ],
                }),
                Vec::new(),
            ),
            ChannelKind::Discord => (
                json!({
                    "embeds": [
                        {
                            "title": event.title,
                            "description": event.message,
                            "footer": {"text": event.session_name},
                        }
                    ],
                }),
                Vec::new(),
            ),
            ChannelKind::Webhook => (
                json!({
                    "event_type": event.event_type,
                    "title": event.title,
                    "message": event.message,
                    "session_name": event.session_name,
                    "session_id": event.session_id,
                    "priority": self.priority,
                    "timestamp": event.timestamp,
                    "tags": event.tags,
                    "extra": event.extra,
                }),
                Vec::new(),
            ),
        }
    }
}
