//! Persistent operator UI state: a single flat JSON object on disk.
//!
//! Loads tolerate a missing, empty, or corrupt file (empty state); saves are
//! best-effort and never raise. Mutations serialise on an internal mutex.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::warn;

pub struct UiState {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl UiState {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Read a value, or `default` when the key (or the file) is absent.
    pub fn get(&self, key: &str, default: Value) -> Value {
        self.load().remove(key).unwrap_or(default)
    }

    /// Store a value. Read-modify-write so unrelated keys survive.
    pub fn set(&self, key: &str, value: Value) {
        let _guard = self.write_lock.lock().unwrap();
        let mut state = self.load();
        state.insert(key.to_string(), value);
        self.save(&state);
    }

    /// Flip a boolean key and return the new value. Absent keys start from
    /// `default`, so the first toggle of a fresh key returns `!default`.
    pub fn toggle(&self, key: &str, default: bool) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        let mut state = self.load();
        let current = state
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default);
        let next = !current;
        state.insert(key.to_string(), Value::Bool(next));
        self.save(&state);
        next
    }

    fn load(&self) -> Map<String, Value> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(_) => return Map::new(),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    fn save(&self, state: &Map<String, Value>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let rendered = match serde_json::to_string_pretty(state) {
            Ok(s) => s,
            Err(e) => {
                warn!("ui state serialise failed: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, rendered) {
            warn!(path = %self.path.display(), "ui state save failed: {e}");
        }
    }
}
