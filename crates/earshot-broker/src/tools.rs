//! Tool handlers. Blocking tools enqueue an inbox item, hold a drop-guard on
//! the item's owner token (so a dead caller is detectable at peek), and wait
//! on the completion latch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use earshot_core::config::{EMOTION_PRESETS, STT_MODELS, TTS_MODELS};
use earshot_core::event::FrontendEvent;
use earshot_sessions::{sentinel, Choice, InboxItem, Session};

use crate::dispatch::{arg_str, require_str, truncate, ToolDispatcher, ToolInvocation};
use crate::{Result, ToolError, BLOCKING_TOOL_TIMEOUT};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const STDOUT_CAP: usize = 5000;
const STDERR_CAP: usize = 2000;
const PREVIEW_CAP: usize = 100;

impl ToolDispatcher {
    pub(crate) async fn handle(
        &self,
        session: &Arc<Session>,
        inv: &ToolInvocation,
    ) -> Result<String> {
        match inv.tool.as_str() {
            "register_session" => self.register_session(session, &inv.args),
            "rename_session" => self.rename_session(session, &inv.args),
            "present_choices" => self.present_choices(session, &inv.args).await,
            "present_multi_select" => self.present_multi_select(session, &inv.args).await,
            "speak" => self.speak(session, &inv.args, true, 0).await,
            "speak_async" => self.speak_async(session, &inv.args),
            "speak_urgent" => self.speak(session, &inv.args, true, 1).await,
            "run_command" => self.run_command(session, &inv.args).await,
            "request_close" => self.request_close(session).await,
            "get_settings" => self.get_settings(),
            "get_logs" => Ok(session.activity_json(50).to_string()),
            "set_speed" => self.set_speed(&inv.args),
            "set_voice" => self.set_voice(&inv.args),
            "set_tts_model" => self.set_tts_model(&inv.args),
            "set_stt_model" => self.set_stt_model(&inv.args),
            "set_emotion" => self.set_emotion(&inv.args),
            "reload_config" => self.reload_config(),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    // --- session identity --------------------------------------------------

    fn register_session(&self, session: &Arc<Session>, args: &Value) -> Result<String> {
        let metadata = args
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        session.register(
            arg_str(args, "cwd"),
            arg_str(args, "hostname"),
            arg_str(args, "tmux_session"),
            arg_str(args, "tmux_pane"),
            arg_str(args, "name"),
            arg_str(args, "voice"),
            arg_str(args, "emotion"),
            metadata,
        );
        self.manager.restore_if_known(session);
        self.persist_registered();

        let local = earshot_core::diag::local_hostname();
        let claimed = arg_str(args, "hostname");
        let is_local = claimed.is_empty() || claimed == local;

        Ok(json!({
            "status": "registered",
            "session_id": session.session_id,
            "name": session.name(),
            "is_local": is_local,
            "broker_hostname": local,
            "features": [
                "present_choices", "present_multi_select",
                "speak", "speak_async", "speak_urgent",
                "set_speed", "set_voice", "set_emotion",
                "set_tts_model", "set_stt_model",
                "rename_session", "get_settings", "get_logs",
                "reload_config", "run_command", "request_close",
            ],
        })
        .to_string())
    }

    fn rename_session(&self, session: &Arc<Session>, args: &Value) -> Result<String> {
        let name = require_str(args, "name")?;
        session.set_name(&name);
        Ok(format!("Session renamed to: {name}"))
    }

    // --- presentation ------------------------------------------------------

    /// Present choices and wait. The `_undo` sentinel is consumed here:
    /// the same presentation is re-enqueued and the agent never sees it.
    async fn present_choices(&self, session: &Arc<Session>, args: &Value) -> Result<String> {
        let preamble = require_str(args, "preamble")?;
        let mut choices = parse_choices(args)?;
        if choices.is_empty() {
            return Ok(json!({"selected": "error", "summary": "No choices provided"}).to_string());
        }
        self.append_extra_options(&mut choices);

        loop {
            let owner = CancellationToken::new();
            let _guard = owner.clone().drop_guard();
            let item = InboxItem::choices(&preamble, choices.clone(), owner);
            session.enqueue(item.clone());

            if !item.wait(BLOCKING_TOOL_TIMEOUT).await {
                return self.operator_timeout(session, &preamble).await;
            }

            let result = item
                .result()
                .unwrap_or_else(|| json!({"selected": sentinel::CANCELLED}));
            if result.get("selected").and_then(Value::as_str) == Some(sentinel::UNDO) {
                debug!(session_id = %session.session_id, "undo selected, re-presenting");
                continue;
            }
            return Ok(result.to_string());
        }
    }

    async fn present_multi_select(&self, session: &Arc<Session>, args: &Value) -> Result<String> {
        let preamble = require_str(args, "preamble")?;
        let choices = parse_choices(args)?;
        if choices.is_empty() {
            return Ok(json!({"selected": []}).to_string());
        }

        let owner = CancellationToken::new();
        let _guard = owner.clone().drop_guard();
        let item = InboxItem::multi_select(&preamble, choices, owner);
        session.enqueue(item.clone());

        if !item.wait(BLOCKING_TOOL_TIMEOUT).await {
            return self.operator_timeout(session, &preamble).await;
        }
        let result = item
            .result()
            .unwrap_or_else(|| json!({"selected": []}));
        Ok(result.to_string())
    }

    async fn speak(
        &self,
        session: &Arc<Session>,
        args: &Value,
        blocking: bool,
        priority: i32,
    ) -> Result<String> {
        let text = require_str(args, "text")?;
        let owner = CancellationToken::new();
        let _guard = owner.clone().drop_guard();
        let item = InboxItem::speech(&text, blocking, priority, owner);
        session.enqueue(item.clone());

        if !item.wait(BLOCKING_TOOL_TIMEOUT).await {
            return self.operator_timeout(session, &text).await;
        }
        let verb = if priority > 0 { "Urgently spoke" } else { "Spoke" };
        Ok(format!("{verb}: {}", preview(&text)))
    }

    /// Non-blocking speech: the item's owner token is deliberately unguarded
    /// (nobody waits on it), so the orphan sweep leaves it alone.
    fn speak_async(&self, session: &Arc<Session>, args: &Value) -> Result<String> {
        let text = require_str(args, "text")?;
        let item = InboxItem::speech(&text, false, 0, CancellationToken::new());
        session.enqueue(item);
        Ok(format!("Spoke: {}", preview(&text)))
    }

    // --- shell -------------------------------------------------------------

    /// Confirm with the operator, then run the command with a hard timeout
    /// and capped output.
    async fn run_command(&self, session: &Arc<Session>, args: &Value) -> Result<String> {
        let command = require_str(args, "command")?;

        let owner = CancellationToken::new();
        let _guard = owner.clone().drop_guard();
        let item = InboxItem::confirm(
            &format!("Agent wants to run: {command}"),
            vec![
                Choice::new("Approve", &format!("Run: {command}")),
                Choice::new("Deny", "Reject this command"),
            ],
            owner,
        );
        session.enqueue(item.clone());

        if !item.wait(BLOCKING_TOOL_TIMEOUT).await {
            return self
                .operator_timeout(session, &format!("Agent wants to run: {command}"))
                .await;
        }

        let selected = item
            .result()
            .and_then(|r| r.get("selected").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        if !selected.eq_ignore_ascii_case("approve") {
            return Ok(json!({"status": "denied", "command": command}).to_string());
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => Ok(json!({
                "status": "completed",
                "command": command,
                "returncode": output.status.code().unwrap_or(-1),
                "stdout": truncate(&String::from_utf8_lossy(&output.stdout), STDOUT_CAP),
                "stderr": truncate(&String::from_utf8_lossy(&output.stderr), STDERR_CAP),
            })
            .to_string()),
            Ok(Err(e)) => Ok(json!({
                "status": "error",
                "command": command,
                "error": e.to_string(),
            })
            .to_string()),
            Err(_) => Ok(json!({
                "status": "timeout",
                "command": command,
                "error": "Command timed out after 60s",
            })
            .to_string()),
        }
    }

    async fn request_close(&self, session: &Arc<Session>) -> Result<String> {
        let owner = CancellationToken::new();
        let _guard = owner.clone().drop_guard();
        let preamble = "Agent requests to close this session";
        let item = InboxItem::confirm(
            preamble,
            vec![
                Choice::new("Approve", "Close and remove the session"),
                Choice::new("Deny", "Keep the session open"),
            ],
            owner,
        );
        session.enqueue(item.clone());

        if !item.wait(BLOCKING_TOOL_TIMEOUT).await {
            return self.operator_timeout(session, preamble).await;
        }
        let approved = item
            .result()
            .and_then(|r| r.get("selected").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
            .eq_ignore_ascii_case("approve");

        if approved {
            self.manager.remove(&session.session_id);
            Ok(json!({"status": "closed"}).to_string())
        } else {
            Ok(json!({"status": "kept"}).to_string())
        }
    }

    // --- settings ----------------------------------------------------------

    fn get_settings(&self) -> Result<String> {
        let config = self.config.read().unwrap();
        Ok(json!({
            "tts_model": config.tts.model,
            "tts_voice": config.tts.voice,
            "tts_speed": config.tts.speed,
            "tts_emotion": config.tts.emotion,
            "tts_voice_options": config.tts_voice_options(),
            "tts_models": TTS_MODELS.iter().map(|(m, _)| *m).collect::<Vec<_>>(),
            "emotion_presets": EMOTION_PRESETS,
            "stt_model": config.tts.stt_model,
            "stt_models": STT_MODELS,
        })
        .to_string())
    }

    fn set_speed(&self, args: &Value) -> Result<String> {
        let speed = args
            .get("speed")
            .and_then(Value::as_f64)
            .ok_or_else(|| ToolError::InvalidArguments("missing required argument 'speed'".into()))?;
        self.config.write().unwrap().set_tts_speed(speed);
        self.save_config();
        self.tts.clear_cache();
        self.emit_settings_changed();
        Ok(format!("Speed set to {speed}"))
    }

    fn set_voice(&self, args: &Value) -> Result<String> {
        let voice = require_str(args, "voice")?;
        self.config.write().unwrap().set_tts_voice(&voice);
        self.save_config();
        self.tts.clear_cache();
        self.emit_settings_changed();
        Ok(format!("Voice set to {voice}"))
    }

    fn set_tts_model(&self, args: &Value) -> Result<String> {
        let model = require_str(args, "model")?;
        let voice = {
            let mut config = self.config.write().unwrap();
            config.set_tts_model(&model);
            config.tts.voice.clone()
        };
        self.save_config();
        self.tts.clear_cache();
        self.emit_settings_changed();
        Ok(format!("TTS model set to {model}, voice reset to {voice}"))
    }

    fn set_stt_model(&self, args: &Value) -> Result<String> {
        let model = require_str(args, "model")?;
        self.config.write().unwrap().set_stt_model(&model);
        self.save_config();
        self.emit_settings_changed();
        Ok(format!("STT model set to {model}"))
    }

    fn set_emotion(&self, args: &Value) -> Result<String> {
        let emotion = require_str(args, "emotion")?;
        self.config.write().unwrap().set_tts_emotion(&emotion);
        self.save_config();
        self.tts.clear_cache();
        self.emit_settings_changed();
        Ok(format!("Emotion set to: {emotion}"))
    }

    fn reload_config(&self) -> Result<String> {
        let reloaded = earshot_core::config::EarshotConfig::load(self.config_path.as_deref())
            .map_err(|e| ToolError::Internal(e.to_string()))?;
        *self.config.write().unwrap() = reloaded;
        self.tts.clear_cache();
        let config = self.config.read().unwrap();
        Ok(json!({
            "status": "reloaded",
            "tts_model": config.tts.model,
            "tts_voice": config.tts.voice,
            "tts_speed": config.tts.speed,
            "tts_emotion": config.tts.emotion,
            "stt_model": config.tts.stt_model,
        })
        .to_string())
    }

    // --- helpers -----------------------------------------------------------

    async fn operator_timeout(&self, session: &Arc<Session>, preamble: &str) -> Result<String> {
        // Best-effort: let the UI drop the stuck presentation. The item stays
        // queued; the orphan sweep resolves it once our drop-guard fires.
        self.collab.cancel_current(&session.session_id).await;
        self.bus.publish(FrontendEvent::new(
            "choices_timeout",
            json!({"preamble": preamble}),
            &session.session_id,
        ));
        Err(ToolError::OperatorTimeout)
    }

    /// Append config-defined extra options, skipping labels already present
    /// (case-insensitive).
    fn append_extra_options(&self, choices: &mut Vec<Choice>) {
        let extras = self.config.read().unwrap().extra_options.clone();
        for extra in extras {
            let exists = choices
                .iter()
                .any(|c| c.label.eq_ignore_ascii_case(&extra.label));
            if !exists {
                choices.push(Choice {
                    label: extra.label,
                    summary: extra.summary,
                    silent: extra.silent,
                });
            }
        }
    }

    fn emit_settings_changed(&self) {
        let config = self.config.read().unwrap();
        self.bus.emit_settings_changed(json!({
            "tts_model": config.tts.model,
            "tts_voice": config.tts.voice,
            "tts_speed": config.tts.speed,
            "tts_emotion": config.tts.emotion,
            "stt_model": config.tts.stt_model,
        }));
    }
}

fn parse_choices(args: &Value) -> Result<Vec<Choice>> {
    match args.get("choices") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| ToolError::InvalidArguments(format!("bad choices list: {e}"))),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CAP {
        format!("{}...", truncate(text, PREVIEW_CAP))
    } else {
        text.to_string()
    }
}
