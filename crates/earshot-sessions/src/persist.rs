//! Registered-session persistence: a JSON array on disk holding identifying
//! metadata plus the recent activity tail, enough to rehydrate the chat view
//! after a broker restart. Inbox contents are deliberately not persisted.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::session::{HistoryEntry, SpeechEntry};
use crate::{Result, SessionError};

/// Most recent speech/history entries kept per session on disk.
pub const RESTORE_CAP: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tmux_session: String,
    #[serde(default)]
    pub tmux_pane: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub emotion: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub speech_log: Vec<SpeechEntry>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub tool_call_count: u64,
    #[serde(default)]
    pub last_tool_name: String,
    #[serde(default)]
    pub last_tool_call: f64,
}

/// Write the registered-session records atomically (temp file + rename).
pub fn save(path: &Path, sessions: &[PersistedSession]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
    }
    let rendered = serde_json::to_string_pretty(sessions)
        .map_err(|e| SessionError::Persistence(e.to_string()))?;

    let parent = path.parent().unwrap_or(Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".earshot-sessions-")
        .tempfile_in(parent)
        .map_err(|e| SessionError::Persistence(e.to_string()))?;
    std::fs::write(tmp.path(), rendered)
        .map_err(|e| SessionError::Persistence(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| SessionError::Persistence(e.to_string()))?;
    Ok(())
}

/// Load persisted records. Missing or unreadable files yield an empty list;
/// persistence failures are never fatal to the broker.
pub fn load(path: &Path) -> Vec<PersistedSession> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(path = %path.display(), "registered-sessions file unreadable: {e}");
            Vec::new()
        }
    }
}
