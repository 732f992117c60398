//! Contract between the broker core and the operator-facing UI layer.
//!
//! The UI (TUI, mobile shell, …) lives outside this workspace's core; the
//! drain loop hands it one inbox item at a time and it returns the
//! operator's answer. Implementations must be thread-safe.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::inbox::Choice;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("no UI attached")]
    NoUi,

    #[error("presentation cancelled")]
    Cancelled,

    #[error("presentation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Show choices and block until the operator selects one. Returns
    /// `{"selected": "<label>", "summary": "<summary>"}` (sentinels allowed).
    async fn present_choices(
        &self,
        session: Arc<Session>,
        preamble: &str,
        choices: &[Choice],
    ) -> Result<Value, CollabError>;

    /// Checkbox variant. Returns `{"selected": [{label, summary}, …]}`.
    async fn present_multi_select(
        &self,
        session: Arc<Session>,
        preamble: &str,
        choices: &[Choice],
    ) -> Result<Value, CollabError>;

    /// Speak for the session and return once playback finishes.
    async fn speak_blocking(&self, session: Arc<Session>, text: &str) -> Result<(), CollabError>;

    /// Yes/no style confirmation; defaults to the choices presentation.
    async fn confirm(
        &self,
        session: Arc<Session>,
        preamble: &str,
        choices: &[Choice],
    ) -> Result<Value, CollabError> {
        self.present_choices(session, preamble, choices).await
    }

    /// Best-effort cancel of whatever is currently presented for a session
    /// (dispatcher timeout path). Default: nothing to cancel.
    async fn cancel_current(&self, _session_id: &str) {}

    /// The session is gone; drop any UI state for it.
    fn on_session_removed(&self, _session_id: &str) {}
}
