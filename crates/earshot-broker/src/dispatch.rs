//! The dispatch pipeline shared by every tool.

use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::{error, warn};

use earshot_core::config::EarshotConfig;
use earshot_core::event::EventBus;
use earshot_sessions::{drain, Collaborator, Session, SessionManager};
use earshot_tts::{SpeakOptions, TtsEngine};

use crate::{ToolError, ERROR_SUGGESTION};

/// One decoded tool invocation, as delivered by the RPC layer.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Value,
    /// Stable session id from the transport; absent ids fall back to the
    /// transport context's identity hash.
    pub session_id: Option<String>,
    pub context_hash: u64,
}

impl ToolInvocation {
    pub fn new(tool: &str, args: Value, session_id: &str) -> Self {
        Self {
            tool: tool.to_string(),
            args,
            session_id: Some(session_id.to_string()),
            context_hash: 0,
        }
    }
}

pub struct ToolDispatcher {
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) tts: Arc<TtsEngine>,
    pub(crate) collab: Arc<dyn Collaborator>,
    pub(crate) config: Arc<RwLock<EarshotConfig>>,
    pub(crate) config_path: Option<String>,
}

impl ToolDispatcher {
    pub fn new(
        manager: Arc<SessionManager>,
        bus: Arc<EventBus>,
        tts: Arc<TtsEngine>,
        collab: Arc<dyn Collaborator>,
        config: Arc<RwLock<EarshotConfig>>,
        config_path: Option<String>,
    ) -> Self {
        Self {
            manager,
            bus,
            tts,
            collab,
            config,
            config_path,
        }
    }

    /// Run one tool invocation to completion. Never panics across the tool
    /// boundary: the return value is always either the handler's response or
    /// the stable error JSON.
    pub async fn dispatch(&self, inv: ToolInvocation) -> String {
        let session_id = inv
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("ctx-{:016x}", inv.context_hash));

        let session = self.resolve_session(&session_id);
        session.touch(&inv.tool);

        match self.handle(&session, &inv).await {
            Ok(response) => {
                let response = self.attach_messages(response, &session);
                if session.is_registered() || inv.tool == "register_session" {
                    response
                } else {
                    format!("{response}{}", registration_reminder())
                }
            }
            Err(err) => {
                error!(tool = %inv.tool, session_id = %session.session_id, "tool failed: {err}");
                let message: String = err.to_string().chars().take(200).collect();
                // The operator hears that something broke even if the agent
                // swallows the error.
                self.tts.speak_async(
                    &format!("Tool error: {}. {}", inv.tool, truncate(&message, 80)),
                    &SpeakOptions::default(),
                );
                json!({
                    "error": format!("{}: {}", err.kind(), message),
                    "tool": inv.tool,
                    "suggestion": ERROR_SUGGESTION,
                })
                .to_string()
            }
        }
    }

    /// Look up or create the session; new sessions get a drain loop and a
    /// `session_created` event.
    fn resolve_session(&self, session_id: &str) -> Arc<Session> {
        let (session, created) = self.manager.get_or_create(session_id);
        if created {
            self.bus.emit_session_created(session_id, &session.name());
            drain::spawn(
                session.clone(),
                self.collab.clone(),
                self.tts.clone(),
                self.bus.clone(),
            );
        }
        session
    }

    /// Merge queued operator messages into the response: a `user_messages`
    /// field for JSON responses, a readable suffix for plain text.
    fn attach_messages(&self, response: String, session: &Arc<Session>) -> String {
        let messages = session.drain_messages();
        if messages.is_empty() {
            return response;
        }
        match serde_json::from_str::<Value>(&response) {
            Ok(Value::Object(mut map)) => {
                map.insert(
                    "user_messages".to_string(),
                    Value::Array(messages.into_iter().map(Value::String).collect()),
                );
                Value::Object(map).to_string()
            }
            _ => {
                let listing: String = messages.iter().map(|m| format!("- {m}\n")).collect();
                format!(
                    "{response}\n\n[User messages queued while you were working:\n{listing}]"
                )
            }
        }
    }

    pub(crate) fn save_config(&self) {
        let config = self.config.read().unwrap().clone();
        config.save(self.config_path.as_deref());
    }

    pub(crate) fn persist_registered(&self) {
        if let Err(e) = self.manager.save_registered() {
            warn!("registered-session save failed: {e}");
        }
    }
}

fn registration_reminder() -> &'static str {
    "\n\n[REMINDER: Call register_session() first with your cwd, hostname, \
     tmux_session, and tmux_pane so the broker can manage your session properly.]"
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub(crate) fn arg_str<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

pub(crate) fn require_str(args: &Value, key: &str) -> crate::Result<String> {
    match args.get(key).and_then(Value::as_str) {
        Some(s) => Ok(s.to_string()),
        None => Err(ToolError::InvalidArguments(format!(
            "missing required argument '{key}'"
        ))),
    }
}
