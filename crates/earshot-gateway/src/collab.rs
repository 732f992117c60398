//! The embedded, speech-only collaborator.
//!
//! A real operator UI (TUI, mobile shell) attaches from outside the broker
//! and implements [`Collaborator`] over its own transport. When none is
//! attached, speech still works end to end; choice presentations fail with
//! `NoUi` and the drain loop force-resolves them as cancelled rather than
//! blocking the agent forever.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use earshot_sessions::{Choice, CollabError, Collaborator, Session};
use earshot_tts::{SpeakOptions, TtsEngine};

pub struct SpeechCollaborator {
    tts: Arc<TtsEngine>,
}

impl SpeechCollaborator {
    pub fn new(tts: Arc<TtsEngine>) -> Arc<Self> {
        Arc::new(Self { tts })
    }
}

#[async_trait]
impl Collaborator for SpeechCollaborator {
    async fn present_choices(
        &self,
        _session: Arc<Session>,
        _preamble: &str,
        _choices: &[Choice],
    ) -> Result<Value, CollabError> {
        Err(CollabError::NoUi)
    }

    async fn present_multi_select(
        &self,
        _session: Arc<Session>,
        _preamble: &str,
        _choices: &[Choice],
    ) -> Result<Value, CollabError> {
        Err(CollabError::NoUi)
    }

    async fn speak_blocking(&self, session: Arc<Session>, text: &str) -> Result<(), CollabError> {
        let (voice, emotion) = session.speak_overrides();
        self.tts
            .speak(text, &SpeakOptions { voice, emotion })
            .await
            .map_err(|e| CollabError::Failed(e.to_string()))
    }
}
