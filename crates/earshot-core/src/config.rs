use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Port assignments. The tool-call RPC layer owns the backend port; the
// operator-facing HTTP API owns the frontend port.
pub const DEFAULT_FRONTEND_PORT: u16 = 8445;
pub const DEFAULT_BACKEND_PORT: u16 = 8444;
pub const DEFAULT_SEND_PORT: u16 = 8446;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// TTS models known to the broker, paired with their default voice.
pub const TTS_MODELS: &[(&str, &str)] = &[
    ("gpt-4o-mini-tts", "alloy"),
    ("mai-voice-1", "maia"),
];

/// STT models selectable via the `set_stt_model` tool.
pub const STT_MODELS: &[&str] = &["whisper", "gpt-4o-mini-transcribe", "mai-ears-1"];

/// Named emotion presets accepted by `set_emotion`; free-form instruction
/// text is also allowed.
pub const EMOTION_PRESETS: &[&str] = &[
    "happy",
    "calm",
    "excited",
    "serious",
    "friendly",
    "neutral",
    "storyteller",
    "gentle",
];

/// Default voice for a TTS model, falling back to the first known model's.
pub fn default_voice_for(model: &str) -> &'static str {
    TTS_MODELS
        .iter()
        .find(|(m, _)| *m == model)
        .map(|(_, v)| *v)
        .unwrap_or(TTS_MODELS[0].1)
}

/// Top-level config (earshot.toml + EARSHOT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EarshotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Extra choice options appended to every `present_choices` call.
    #[serde(default)]
    pub extra_options: Vec<ExtraOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_frontend_port")]
    pub port: u16,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default = "default_send_port")]
    pub send_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_frontend_port(),
            backend_port: default_backend_port(),
            send_port: default_send_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Argv template for the synthesis binary. `{text}` is substituted with
    /// the phrase; the binary writes WAV bytes to stdout.
    #[serde(default = "default_tts_argv")]
    pub binary: Vec<String>,
    /// Argv template for the audio player. The WAV path is appended.
    #[serde(default = "default_player_argv")]
    pub player: Vec<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default = "default_tts_speed")]
    pub speed: f64,
    #[serde(default)]
    pub emotion: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// Per-call synthesis timeout.
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            binary: default_tts_argv(),
            player: default_player_argv(),
            cache_dir: default_cache_dir(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            speed: default_tts_speed(),
            emotion: String::new(),
            stt_model: default_stt_model(),
            generate_timeout_secs: default_generate_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_warning_secs")]
    pub warning_secs: u64,
    #[serde(default = "default_unresponsive_secs")]
    pub unresponsive_secs: u64,
    /// Idle sessions older than this are candidates for stale cleanup.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            warning_secs: default_warning_secs(),
            unresponsive_secs: default_unresponsive_secs(),
            stale_timeout_secs: default_stale_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_notify_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// One outbound notification sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// One of: ntfy, slack, discord, webhook.
    pub kind: String,
    pub url: String,
    #[serde(default = "default_notify_method")]
    pub method: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    /// Event types this channel accepts; "all" matches everything.
    #[serde(default = "default_notify_events")]
    pub events: Vec<String>,
    #[serde(default = "default_notify_priority")]
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_sessions_path")]
    pub sessions_path: String,
    #[serde(default = "default_ui_state_path")]
    pub ui_state_path: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sessions_path: default_sessions_path(),
            ui_state_path: default_ui_state_path(),
            pid_file: default_pid_file(),
        }
    }
}

/// Config-defined extra option appended to every choice list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraOption {
    pub label: String,
    #[serde(default)]
    pub summary: String,
    /// Silent options are skipped by scroll readouts.
    #[serde(default)]
    pub silent: bool,
}

impl EarshotConfig {
    /// Load config from a TOML file with EARSHOT_* env var overrides.
    ///
    /// Checks in order: explicit path argument, then ~/.earshot/earshot.toml.
    pub fn load(config_path: Option<&str>) -> crate::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: EarshotConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("EARSHOT_").split("_"))
            .extract()
            .map_err(|e| crate::EarshotError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Write the current config back to disk as TOML. Best-effort: failures
    /// are logged, never raised, matching the UI-state policy.
    pub fn save(&self, config_path: Option<&str>) {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        let rendered = match toml::to_string_pretty(self) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("config serialise failed: {e}");
                return;
            }
        };
        if let Some(parent) = std::path::Path::new(&path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, rendered) {
            tracing::warn!(%path, "config save failed: {e}");
        }
    }

    // --- settings mutators (used by the set_* tools) -----------------------

    /// Set playback speed, clamped to the supported range.
    pub fn set_tts_speed(&mut self, speed: f64) {
        self.tts.speed = speed.clamp(0.5, 2.5);
    }

    pub fn set_tts_voice(&mut self, voice: &str) {
        self.tts.voice = voice.to_string();
    }

    /// Switch model and reset the voice to the new model's default.
    pub fn set_tts_model(&mut self, model: &str) {
        self.tts.model = model.to_string();
        self.tts.voice = default_voice_for(model).to_string();
    }

    pub fn set_tts_emotion(&mut self, emotion: &str) {
        self.tts.emotion = emotion.to_string();
    }

    pub fn set_stt_model(&mut self, model: &str) {
        self.tts.stt_model = model.to_string();
    }

    /// Voice options for the currently selected model.
    pub fn tts_voice_options(&self) -> Vec<&'static str> {
        match self.tts.model.as_str() {
            "mai-voice-1" => vec!["maia", "rio"],
            _ => vec!["alloy", "echo", "fable", "onyx", "nova", "shimmer"],
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_frontend_port() -> u16 {
    DEFAULT_FRONTEND_PORT
}
fn default_backend_port() -> u16 {
    DEFAULT_BACKEND_PORT
}
fn default_send_port() -> u16 {
    DEFAULT_SEND_PORT
}
fn default_tts_argv() -> Vec<String> {
    vec!["earshot-tts".to_string(), "{text}".to_string()]
}
fn default_player_argv() -> Vec<String> {
    vec!["paplay".to_string()]
}
fn default_cache_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.earshot/tts-cache")
}
fn default_tts_model() -> String {
    TTS_MODELS[0].0.to_string()
}
fn default_tts_voice() -> String {
    TTS_MODELS[0].1.to_string()
}
fn default_tts_speed() -> f64 {
    1.0
}
fn default_stt_model() -> String {
    STT_MODELS[0].to_string()
}
fn default_generate_timeout() -> u64 {
    30
}
fn default_check_interval() -> u64 {
    30
}
fn default_warning_secs() -> u64 {
    300
}
fn default_unresponsive_secs() -> u64 {
    600
}
fn default_stale_timeout() -> u64 {
    3600
}
fn default_notify_cooldown() -> u64 {
    60
}
fn default_notify_method() -> String {
    "POST".to_string()
}
fn default_notify_events() -> Vec<String> {
    vec!["all".to_string()]
}
fn default_notify_priority() -> u8 {
    3
}
fn default_sessions_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.earshot/registered-sessions.json")
}
fn default_ui_state_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.earshot/state.json")
}
fn default_pid_file() -> String {
    "/tmp/earshot.pid".to_string()
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.earshot/earshot.toml")
}
