//! Per-session drain loop: serves the inbox head to the collaborator, writes
//! the result, and wakes the caller.
//!
//! One task per session, spawned at creation and stopped by cancelling the
//! session's `closed` token. The kick signal coalesces: any number of
//! enqueues while an item is being presented cause exactly one re-check.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use earshot_core::event::EventBus;
use earshot_tts::{SpeakOptions, TtsEngine};

use crate::collab::Collaborator;
use crate::inbox::{InboxItem, InboxKind};
use crate::sentinel;
use crate::session::{Session, UndoEntry};

/// Upper bound on one collaborator presentation. Generous: the operator may
/// be away from the wheel; callers enforce their own (shorter) latch waits.
pub const COLLAB_TIMEOUT: Duration = Duration::from_secs(1800);

pub struct DrainLoop {
    session: Arc<Session>,
    collab: Arc<dyn Collaborator>,
    tts: Arc<TtsEngine>,
    bus: Arc<EventBus>,
}

/// Spawn the drain loop for a freshly created session.
pub fn spawn(
    session: Arc<Session>,
    collab: Arc<dyn Collaborator>,
    tts: Arc<TtsEngine>,
    bus: Arc<EventBus>,
) -> tokio::task::JoinHandle<()> {
    let drain = DrainLoop {
        session,
        collab,
        tts,
        bus,
    };
    tokio::spawn(drain.run())
}

impl DrainLoop {
    async fn run(self) {
        debug!(session_id = %self.session.session_id, "drain loop started");
        loop {
            tokio::select! {
                _ = self.session.wait_kick() => {}
                _ = self.session.closed.cancelled() => break,
            }
            while let Some(item) = self.session.peek_inbox() {
                if self.session.closed.is_cancelled() {
                    break;
                }
                self.serve(&item).await;
            }
        }
        debug!(session_id = %self.session.session_id, "drain loop stopped");
    }

    /// Present one item, force-resolving with the kind-specific fallback if
    /// the collaborator fails, and finish it so the next item can proceed.
    async fn serve(&self, item: &Arc<InboxItem>) {
        item.set_processing(true);

        if item.kind != InboxKind::Speech {
            self.session.set_active_presentation(item);
            // Speak the prompt so the operator hears the question arrive even
            // before they focus this session.
            if !item.preamble.is_empty() {
                let (voice, emotion) = self.session.speak_overrides();
                self.tts
                    .speak_with_local_fallback(&item.preamble, &SpeakOptions { voice, emotion })
                    .await;
            }
        }

        let outcome = tokio::time::timeout(COLLAB_TIMEOUT, self.dispatch(item)).await;
        let result = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(session_id = %self.session.session_id, kind = ?item.kind,
                    "collaborator failed, force-resolving: {e}");
                json!({"selected": fallback_sentinel(item.kind)})
            }
            Err(_) => {
                warn!(session_id = %self.session.session_id, kind = ?item.kind,
                    "collaborator timed out, force-resolving");
                json!({"selected": fallback_sentinel(item.kind)})
            }
        };

        let selected = result
            .get("selected")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // An orphan sweep may have resolved the item while it was on screen;
        // resolve() is at-most-once so this is safe either way.
        item.resolve(result.clone());
        self.session.finish_item(item);

        match item.kind {
            InboxKind::Speech => {
                self.session.record_speech(&item.text, true);
            }
            _ => {
                if let Some(selected) = &selected {
                    if !selected.starts_with('_') {
                        self.session.record_selection(&item.preamble, selected);
                        self.session.push_undo(UndoEntry {
                            preamble: item.preamble.clone(),
                            choices: item.choices.clone(),
                            selection: selected.clone(),
                        });
                    }
                    self.bus
                        .emit_selection_made(&self.session.session_id, selected);
                }
            }
        }
    }

    async fn dispatch(&self, item: &Arc<InboxItem>) -> Result<serde_json::Value, crate::CollabError> {
        match item.kind {
            InboxKind::Choices => {
                self.collab
                    .present_choices(self.session.clone(), &item.preamble, &item.choices)
                    .await
            }
            InboxKind::MultiSelect => {
                self.collab
                    .present_multi_select(self.session.clone(), &item.preamble, &item.choices)
                    .await
            }
            InboxKind::Confirm => {
                self.collab
                    .confirm(self.session.clone(), &item.preamble, &item.choices)
                    .await
            }
            InboxKind::Speech => {
                self.collab
                    .speak_blocking(self.session.clone(), &item.text)
                    .await?;
                Ok(json!({"selected": sentinel::SPEECH_DONE}))
            }
        }
    }
}

fn fallback_sentinel(kind: InboxKind) -> &'static str {
    match kind {
        InboxKind::Speech => sentinel::SPEECH_DONE,
        _ => sentinel::CANCELLED,
    }
}
