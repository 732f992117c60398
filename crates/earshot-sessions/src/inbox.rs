//! One unit of operator work: a question, a multi-select, a confirmation, or
//! a phrase to speak.
//!
//! The item carries the identity of the tool-call task that is waiting on it
//! (a cancellation token; cancelled means the caller is gone) and a one-shot
//! completion latch. Resolution is at-most-once: whichever path resolves
//! first (operator, force-cancel, orphan sweep) wins, and the latch is
//! signalled exactly once.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Choices,
    MultiSelect,
    Speech,
    Confirm,
}

/// One selectable option.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize, PartialEq)]
pub struct Choice {
    pub label: String,
    #[serde(default)]
    pub summary: String,
    /// Silent options are skipped by scroll readouts.
    #[serde(default)]
    pub silent: bool,
}

impl Choice {
    pub fn new(label: &str, summary: &str) -> Self {
        Self {
            label: label.to_string(),
            summary: summary.to_string(),
            silent: false,
        }
    }
}

struct ItemState {
    processing: bool,
    done: bool,
    result: Option<Value>,
}

pub struct InboxItem {
    pub kind: InboxKind,
    pub preamble: String,
    pub choices: Vec<Choice>,
    pub text: String,
    pub blocking: bool,
    pub priority: i32,
    /// Identity of the waiting caller; cancelled token = orphaned item.
    pub owner: CancellationToken,
    pub timestamp: f64,
    state: Mutex<ItemState>,
    latch_tx: watch::Sender<bool>,
    latch_rx: watch::Receiver<bool>,
}

impl InboxItem {
    fn new(
        kind: InboxKind,
        preamble: String,
        choices: Vec<Choice>,
        text: String,
        blocking: bool,
        priority: i32,
        owner: CancellationToken,
    ) -> std::sync::Arc<Self> {
        let (latch_tx, latch_rx) = watch::channel(false);
        std::sync::Arc::new(Self {
            kind,
            preamble,
            choices,
            text,
            blocking,
            priority,
            owner,
            timestamp: earshot_core::epoch_now(),
            state: Mutex::new(ItemState {
                processing: false,
                done: false,
                result: None,
            }),
            latch_tx,
            latch_rx,
        })
    }

    pub fn choices(
        preamble: &str,
        choices: Vec<Choice>,
        owner: CancellationToken,
    ) -> std::sync::Arc<Self> {
        Self::new(
            InboxKind::Choices,
            preamble.to_string(),
            choices,
            String::new(),
            true,
            0,
            owner,
        )
    }

    pub fn multi_select(
        preamble: &str,
        choices: Vec<Choice>,
        owner: CancellationToken,
    ) -> std::sync::Arc<Self> {
        Self::new(
            InboxKind::MultiSelect,
            preamble.to_string(),
            choices,
            String::new(),
            true,
            0,
            owner,
        )
    }

    pub fn speech(
        text: &str,
        blocking: bool,
        priority: i32,
        owner: CancellationToken,
    ) -> std::sync::Arc<Self> {
        Self::new(
            InboxKind::Speech,
            String::new(),
            Vec::new(),
            text.to_string(),
            blocking,
            priority,
            owner,
        )
    }

    pub fn confirm(
        preamble: &str,
        choices: Vec<Choice>,
        owner: CancellationToken,
    ) -> std::sync::Arc<Self> {
        Self::new(
            InboxKind::Confirm,
            preamble.to_string(),
            choices,
            String::new(),
            true,
            0,
            owner,
        )
    }

    /// Urgent speech overtakes queued non-urgent speech.
    pub fn is_urgent_speech(&self) -> bool {
        self.kind == InboxKind::Speech && (self.priority > 0 || self.blocking)
    }

    pub fn is_orphaned(&self) -> bool {
        self.owner.is_cancelled()
    }

    pub fn is_processing(&self) -> bool {
        self.state.lock().unwrap().processing
    }

    pub fn set_processing(&self, processing: bool) {
        self.state.lock().unwrap().processing = processing;
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    pub fn result(&self) -> Option<Value> {
        self.state.lock().unwrap().result.clone()
    }

    /// Write the result and signal the latch. At-most-once: returns `false`
    /// (and changes nothing) when the item was already resolved.
    pub fn resolve(&self, result: Value) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                return false;
            }
            state.done = true;
            state.processing = false;
            state.result = Some(result);
        }
        // Latch is signalled outside the state lock.
        let _ = self.latch_tx.send(true);
        true
    }

    pub fn latch_signalled(&self) -> bool {
        *self.latch_rx.borrow()
    }

    /// Wait up to `timeout` for resolution. Returns `true` when resolved.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.latch_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|signalled| *signalled)).await;
        result.is_ok()
    }
}
