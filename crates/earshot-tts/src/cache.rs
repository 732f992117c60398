//! Content-addressed WAV cache.
//!
//! Keys hash the normalised phrase together with every setting that changes
//! the rendered audio, so a settings change naturally misses and the old
//! files become garbage collected by `clear`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::warn;

pub struct AudioCache {
    dir: PathBuf,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl AudioCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "cache dir create failed: {e}");
        }
        Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key over (normalised text, voice, emotion, model, speed).
    pub fn key(text: &str, voice: &str, emotion: &str, model: &str, speed: f64) -> String {
        let normalised = normalise(text);
        let mut hasher = Sha256::new();
        hasher.update(normalised.as_bytes());
        hasher.update([0]);
        hasher.update(voice.as_bytes());
        hasher.update([0]);
        hasher.update(emotion.as_bytes());
        hasher.update([0]);
        hasher.update(model.as_bytes());
        hasher.update([0]);
        hasher.update(format!("{speed:.2}").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Cached WAV for `key`, if it is still on disk.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).filter(|p| p.is_file()).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&self, key: &str, path: PathBuf) {
        self.entries.lock().unwrap().insert(key.to_string(), path);
    }

    /// Final on-disk location for a key.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.wav"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the map and delete every cached file.
    pub fn clear(&self) {
        let paths: Vec<PathBuf> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, p)| p).collect()
        };
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn normalise(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
