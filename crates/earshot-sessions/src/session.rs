//! Per-agent session state: the inbox queue, logs, undo stack, pending
//! operator messages, and health, all guarded by one session-level mutex.
//! The completion latches and the drain kick live outside it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use earshot_core::event::EventBus;

use crate::inbox::{Choice, InboxItem, InboxKind};
use crate::persist::PersistedSession;
use crate::sentinel;

pub const DONE_LOG_CAP: usize = 200;
pub const SPEECH_LOG_CAP: usize = 200;
pub const HISTORY_CAP: usize = 200;
pub const UNDO_CAP: usize = 5;
const FLUSHED_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unresponsive,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SpeechEntry {
    pub text: String,
    pub timestamp: f64,
    pub played: bool,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub preamble: String,
    pub selected: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub preamble: String,
    pub choices: Vec<Choice>,
    pub selection: String,
}

/// Listing row for the HTTP API and tab bar.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub registered: bool,
    pub cwd: String,
    pub hostname: String,
    pub health: HealthStatus,
}

pub(crate) struct SessionState {
    pub name: String,
    pub cwd: String,
    pub hostname: String,
    pub tmux_session: String,
    pub tmux_pane: String,
    pub metadata: Map<String, Value>,
    pub registered: bool,

    pub last_activity: f64,
    pub last_tool_call: f64,
    pub tool_call_count: u64,
    pub last_tool_name: String,

    pub inbox: VecDeque<Arc<InboxItem>>,
    pub done_log: VecDeque<Arc<InboxItem>>,
    pub speech_log: VecDeque<SpeechEntry>,
    pub history: VecDeque<HistoryEntry>,

    pub pending_messages: VecDeque<String>,
    pub flushed_messages: VecDeque<String>,

    pub undo_stack: Vec<UndoEntry>,
    pub last_preamble: String,
    pub last_choices: Vec<Choice>,

    pub active: bool,
    pub preamble: String,
    pub choices: Vec<Choice>,
    pub active_item: Option<Arc<InboxItem>>,

    pub health_status: HealthStatus,
    pub health_alert_spoken: bool,

    // UI ephemera, opaque to the broker core.
    pub voice_override: String,
    pub emotion_override: String,
    pub input_mode: String,
    pub scroll_index: usize,
    pub waiting_announced: bool,
}

pub struct Session {
    pub session_id: String,
    pub created_at: f64,
    /// Cancelled when the session is removed; stops the drain loop.
    pub closed: CancellationToken,
    inner: Mutex<SessionState>,
    drain_kick: Notify,
    bus: Arc<EventBus>,
}

impl Session {
    pub fn new(session_id: &str, bus: Arc<EventBus>) -> Arc<Self> {
        let now = earshot_core::epoch_now();
        Arc::new(Self {
            session_id: session_id.to_string(),
            created_at: now,
            closed: CancellationToken::new(),
            inner: Mutex::new(SessionState {
                name: format!("agent-{}", session_id.chars().take(8).collect::<String>()),
                cwd: String::new(),
                hostname: String::new(),
                tmux_session: String::new(),
                tmux_pane: String::new(),
                metadata: Map::new(),
                registered: false,
                last_activity: now,
                last_tool_call: now,
                tool_call_count: 0,
                last_tool_name: String::new(),
                inbox: VecDeque::new(),
                done_log: VecDeque::new(),
                speech_log: VecDeque::new(),
                history: VecDeque::new(),
                pending_messages: VecDeque::new(),
                flushed_messages: VecDeque::new(),
                undo_stack: Vec::new(),
                last_preamble: String::new(),
                last_choices: Vec::new(),
                active: false,
                preamble: String::new(),
                choices: Vec::new(),
                active_item: None,
                health_status: HealthStatus::Healthy,
                health_alert_spoken: false,
                voice_override: String::new(),
                emotion_override: String::new(),
                input_mode: String::new(),
                scroll_index: 0,
                waiting_announced: false,
            }),
            drain_kick: Notify::new(),
            bus,
        })
    }

    // --- tool-call bookkeeping --------------------------------------------

    /// Record an incoming tool call: activity timestamps, counters, and a
    /// health reset (the agent is demonstrably alive again).
    pub fn touch(&self, tool_name: &str) {
        let now = earshot_core::epoch_now();
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = now;
        inner.last_tool_call = now;
        inner.tool_call_count += 1;
        inner.last_tool_name = tool_name.to_string();
        inner.waiting_announced = false;
        if inner.health_status != HealthStatus::Healthy {
            inner.health_status = HealthStatus::Healthy;
            inner.health_alert_spoken = false;
        }
    }

    // --- inbox -------------------------------------------------------------

    /// Append an item. Urgent speech is inserted before the trailing run of
    /// non-urgent speech so it overtakes queued chatter, but it never passes
    /// a question or an item already being presented. Publishes the matching
    /// frontend event and kicks the drain loop.
    pub fn enqueue(&self, item: Arc<InboxItem>) {
        {
            let mut inner = self.inner.lock().unwrap();
            let mut insert_at = inner.inbox.len();
            if item.is_urgent_speech() {
                while insert_at > 0 {
                    let prev = &inner.inbox[insert_at - 1];
                    if prev.is_processing() {
                        break;
                    }
                    if prev.kind == InboxKind::Speech && !prev.is_urgent_speech() {
                        insert_at -= 1;
                    } else {
                        break;
                    }
                }
            }
            inner.inbox.insert(insert_at, item.clone());
        }

        match item.kind {
            InboxKind::Speech => {
                self.bus
                    .emit_speech_requested(&self.session_id, &item.text, item.blocking);
            }
            _ => {
                self.bus.emit_choices_presented(
                    &self.session_id,
                    &item.preamble,
                    serde_json::to_value(&item.choices).unwrap_or(Value::Null),
                );
            }
        }
        self.kick();
    }

    /// Head of the inbox after the head-walk: done heads are popped, and
    /// every consecutive orphaned head is resolved with `_restart` and moved
    /// to the done log, all in this single call.
    pub fn peek_inbox(&self) -> Option<Arc<InboxItem>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let head = inner.inbox.front()?.clone();
            if head.is_done() {
                inner.inbox.pop_front();
                push_capped(&mut inner.done_log, head, DONE_LOG_CAP);
                continue;
            }
            if head.is_orphaned() {
                head.resolve(json!({"selected": sentinel::RESTART}));
                inner.inbox.pop_front();
                push_capped(&mut inner.done_log, head, DONE_LOG_CAP);
                continue;
            }
            return Some(head);
        }
    }

    /// Pop `item` after resolution and append it to the done log. No-op when
    /// the head has already moved on (e.g. an orphan sweep got there first).
    pub fn finish_item(&self, item: &Arc<InboxItem>) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .inbox
            .front()
            .is_some_and(|head| Arc::ptr_eq(head, item))
        {
            inner.inbox.pop_front();
            push_capped(&mut inner.done_log, item.clone(), DONE_LOG_CAP);
        }
        if inner
            .active_item
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, item))
        {
            inner.active = false;
            inner.preamble.clear();
            inner.choices.clear();
            inner.active_item = None;
        }
    }

    /// Force-resolve every queued item with `_cancelled` and clear the
    /// presentation mirror. Every latch is signalled.
    pub fn cancel_all_pending(&self) {
        let items: Vec<Arc<InboxItem>> = {
            let mut inner = self.inner.lock().unwrap();
            let items: Vec<_> = inner.inbox.drain(..).collect();
            inner.active = false;
            inner.preamble.clear();
            inner.choices.clear();
            inner.active_item = None;
            for item in &items {
                push_capped(&mut inner.done_log, item.clone(), DONE_LOG_CAP);
            }
            items
        };
        for item in items {
            item.resolve(json!({"selected": sentinel::CANCELLED}));
        }
        self.kick();
    }

    pub fn inbox_len(&self) -> usize {
        self.inner.lock().unwrap().inbox.len()
    }

    pub fn done_log_len(&self) -> usize {
        self.inner.lock().unwrap().done_log.len()
    }

    /// Mirror the presentation state of the current head for the UI.
    pub fn set_active_presentation(&self, item: &Arc<InboxItem>) {
        let mut inner = self.inner.lock().unwrap();
        inner.active = true;
        inner.preamble = item.preamble.clone();
        inner.choices = item.choices.clone();
        inner.active_item = Some(item.clone());
    }

    pub fn has_active_choices(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    /// The presentation currently on screen (empty when idle).
    pub fn active_presentation(&self) -> (String, Vec<Choice>) {
        let inner = self.inner.lock().unwrap();
        (inner.preamble.clone(), inner.choices.clone())
    }

    // --- drain kick --------------------------------------------------------

    /// Level-triggered, coalescing wakeup for the drain loop.
    pub fn kick(&self) {
        self.drain_kick.notify_one();
    }

    pub async fn wait_kick(&self) {
        self.drain_kick.notified().await;
    }

    // --- speech / history logs --------------------------------------------

    pub fn record_speech(&self, text: &str, played: bool) {
        let mut inner = self.inner.lock().unwrap();
        let entry = SpeechEntry {
            text: text.to_string(),
            timestamp: earshot_core::epoch_now(),
            played,
        };
        push_capped(&mut inner.speech_log, entry, SPEECH_LOG_CAP);
    }

    pub fn record_selection(&self, preamble: &str, selected: &str) {
        let mut inner = self.inner.lock().unwrap();
        let entry = HistoryEntry {
            preamble: preamble.to_string(),
            selected: selected.to_string(),
            timestamp: earshot_core::epoch_now(),
        };
        push_capped(&mut inner.history, entry, HISTORY_CAP);
    }

    pub fn speech_log_len(&self) -> usize {
        self.inner.lock().unwrap().speech_log.len()
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }

    // --- pending operator messages ----------------------------------------

    /// Queue a message for delivery on the agent's next tool call. Returns
    /// the new pending count.
    pub fn queue_message(&self, text: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_messages.push_back(text.to_string());
        inner.pending_messages.len()
    }

    /// Drain pending messages; drained entries are kept briefly in the
    /// flushed list for UI replay.
    pub fn drain_messages(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<String> = inner.pending_messages.drain(..).collect();
        for msg in &drained {
            push_capped(&mut inner.flushed_messages, msg.clone(), FLUSHED_CAP);
        }
        drained
    }

    pub fn pending_message_count(&self) -> usize {
        self.inner.lock().unwrap().pending_messages.len()
    }

    pub fn flushed_messages(&self) -> Vec<String> {
        self.inner.lock().unwrap().flushed_messages.iter().cloned().collect()
    }

    // --- undo stack --------------------------------------------------------

    /// Push a resolved presentation onto the undo stack (bounded; oldest
    /// falls off) and mirror it into the legacy fields.
    pub fn push_undo(&self, entry: UndoEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_preamble = entry.preamble.clone();
        inner.last_choices = entry.choices.clone();
        inner.undo_stack.push(entry);
        if inner.undo_stack.len() > UNDO_CAP {
            inner.undo_stack.remove(0);
        }
    }

    /// Pop the newest undo entry. The mirror fields fall back to the new
    /// top's presentation; popping the last entry clears them.
    pub fn pop_undo(&self) -> Option<UndoEntry> {
        let mut inner = self.inner.lock().unwrap();
        let popped = inner.undo_stack.pop()?;
        match inner.undo_stack.last().map(|top| (top.preamble.clone(), top.choices.clone())) {
            Some((preamble, choices)) => {
                inner.last_preamble = preamble;
                inner.last_choices = choices;
            }
            None => {
                inner.last_preamble.clear();
                inner.last_choices.clear();
            }
        }
        Some(popped)
    }

    pub fn undo_depth(&self) -> usize {
        self.inner.lock().unwrap().undo_stack.len()
    }

    pub fn last_presentation(&self) -> (String, Vec<Choice>) {
        let inner = self.inner.lock().unwrap();
        (inner.last_preamble.clone(), inner.last_choices.clone())
    }

    /// Spoken when the operator undoes: remaining depth after the pop.
    pub fn undo_announcement(remaining: usize) -> String {
        format!("Undo. {remaining} more available")
    }

    // --- health ------------------------------------------------------------

    pub fn health_status(&self) -> HealthStatus {
        self.inner.lock().unwrap().health_status
    }

    /// Set by the health monitor. Returns `true` on a fresh transition into
    /// warning/unresponsive (the alert has not been announced yet).
    pub fn set_health_status(&self, status: HealthStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.health_status == status {
            return false;
        }
        inner.health_status = status;
        if status == HealthStatus::Healthy {
            inner.health_alert_spoken = false;
            false
        } else {
            let fresh = !inner.health_alert_spoken;
            inner.health_alert_spoken = true;
            fresh
        }
    }

    pub fn last_tool_call(&self) -> f64 {
        self.inner.lock().unwrap().last_tool_call
    }

    pub fn last_activity(&self) -> f64 {
        self.inner.lock().unwrap().last_activity
    }

    // --- metadata accessors ------------------------------------------------

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.inner.lock().unwrap().name = name.to_string();
    }

    pub fn is_registered(&self) -> bool {
        self.inner.lock().unwrap().registered
    }

    pub fn tool_call_count(&self) -> u64 {
        self.inner.lock().unwrap().tool_call_count
    }

    pub fn last_tool_name(&self) -> String {
        self.inner.lock().unwrap().last_tool_name.clone()
    }

    pub fn metadata_value(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().metadata.get(key).cloned()
    }

    pub fn speak_overrides(&self) -> (Option<String>, Option<String>) {
        let inner = self.inner.lock().unwrap();
        let voice = (!inner.voice_override.is_empty()).then(|| inner.voice_override.clone());
        let emotion = (!inner.emotion_override.is_empty()).then(|| inner.emotion_override.clone());
        (voice, emotion)
    }

    // --- UI ephemera (owned by the collaborator, opaque to the core) -------

    pub fn input_mode(&self) -> String {
        self.inner.lock().unwrap().input_mode.clone()
    }

    pub fn set_input_mode(&self, mode: &str) {
        self.inner.lock().unwrap().input_mode = mode.to_string();
    }

    pub fn scroll_index(&self) -> usize {
        self.inner.lock().unwrap().scroll_index
    }

    pub fn set_scroll_index(&self, index: usize) {
        self.inner.lock().unwrap().scroll_index = index;
    }

    pub fn waiting_announced(&self) -> bool {
        self.inner.lock().unwrap().waiting_announced
    }

    pub fn set_waiting_announced(&self, announced: bool) {
        self.inner.lock().unwrap().waiting_announced = announced;
    }

    /// Apply registration fields; empty strings leave the field unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        cwd: &str,
        hostname: &str,
        tmux_session: &str,
        tmux_pane: &str,
        name: &str,
        voice: &str,
        emotion: &str,
        metadata: Map<String, Value>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.registered = true;
        if !cwd.is_empty() {
            inner.cwd = cwd.to_string();
        }
        if !hostname.is_empty() {
            inner.hostname = hostname.to_string();
        }
        if !tmux_session.is_empty() {
            inner.tmux_session = tmux_session.to_string();
        }
        if !tmux_pane.is_empty() {
            inner.tmux_pane = tmux_pane.to_string();
        }
        if !name.is_empty() {
            inner.name = name.to_string();
        }
        if !voice.is_empty() {
            inner.voice_override = voice.to_string();
        }
        if !emotion.is_empty() {
            inner.emotion_override = emotion.to_string();
        }
        for (k, v) in metadata {
            inner.metadata.insert(k, v);
        }
    }

    // --- snapshots & persistence ------------------------------------------

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().unwrap();
        SessionInfo {
            id: self.session_id.clone(),
            name: inner.name.clone(),
            active: inner.active,
            registered: inner.registered,
            cwd: inner.cwd.clone(),
            hostname: inner.hostname.clone(),
            health: inner.health_status,
        }
    }

    pub fn to_persisted(&self) -> PersistedSession {
        let inner = self.inner.lock().unwrap();
        PersistedSession {
            session_id: self.session_id.clone(),
            name: inner.name.clone(),
            cwd: inner.cwd.clone(),
            hostname: inner.hostname.clone(),
            tmux_session: inner.tmux_session.clone(),
            tmux_pane: inner.tmux_pane.clone(),
            voice: inner.voice_override.clone(),
            emotion: inner.emotion_override.clone(),
            metadata: inner.metadata.clone(),
            speech_log: tail(&inner.speech_log, crate::persist::RESTORE_CAP),
            history: tail(&inner.history, crate::persist::RESTORE_CAP),
            tool_call_count: inner.tool_call_count,
            last_tool_name: inner.last_tool_name.clone(),
            last_tool_call: inner.last_tool_call,
        }
    }

    /// Rehydrate logs (additive) and counters (replacing) from a persisted
    /// record. Restored speech entries are marked as already played.
    pub fn restore_activity(&self, loaded: &PersistedSession) {
        let mut inner = self.inner.lock().unwrap();
        for entry in &loaded.speech_log {
            let mut entry = entry.clone();
            entry.played = true;
            push_capped(&mut inner.speech_log, entry, SPEECH_LOG_CAP);
        }
        for entry in &loaded.history {
            push_capped(&mut inner.history, entry.clone(), HISTORY_CAP);
        }
        if loaded.tool_call_count > 0 {
            inner.tool_call_count = loaded.tool_call_count;
        }
        if !loaded.last_tool_name.is_empty() {
            inner.last_tool_name = loaded.last_tool_name.clone();
        }
    }

    /// Recent activity for the `get_logs` tool and chat-view reconstruction.
    pub fn activity_json(&self, limit: usize) -> Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "name": inner.name,
            "health": inner.health_status,
            "tool_call_count": inner.tool_call_count,
            "last_tool_name": inner.last_tool_name,
            "speech": tail(&inner.speech_log, limit),
            "history": tail(&inner.history, limit),
        })
    }

    #[doc(hidden)]
    pub fn set_last_tool_call(&self, ts: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_tool_call = ts;
        inner.last_activity = ts;
    }
}

fn push_capped<T>(log: &mut VecDeque<T>, entry: T, cap: usize) {
    log.push_back(entry);
    while log.len() > cap {
        log.pop_front();
    }
}

fn tail<T: Clone>(log: &VecDeque<T>, cap: usize) -> Vec<T> {
    log.iter().rev().take(cap).rev().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::InboxItem;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn enqueue_is_fifo_for_equal_priority() {
        let s = Session::new("s1", bus());
        s.enqueue(InboxItem::choices("q1", vec![], token()));
        s.enqueue(InboxItem::choices("q2", vec![], token()));

        assert_eq!(s.peek_inbox().unwrap().preamble, "q1");
        assert_eq!(s.inbox_len(), 2);
    }

    #[tokio::test]
    async fn urgent_speech_overtakes_nonurgent_speech_only() {
        let s = Session::new("s1", bus());
        s.enqueue(InboxItem::choices("question", vec![], token()));
        s.enqueue(InboxItem::speech("chatter one", false, 0, token()));
        s.enqueue(InboxItem::speech("chatter two", false, 0, token()));
        s.enqueue(InboxItem::speech("urgent", true, 1, token()));

        // Queue must now read: question, urgent, chatter one, chatter two.
        let head = s.peek_inbox().unwrap();
        assert_eq!(head.preamble, "question");
        head.resolve(json!({"selected": "x"}));
        let second = s.peek_inbox().unwrap();
        assert_eq!(second.text, "urgent");
    }

    #[tokio::test]
    async fn urgent_speech_never_passes_processing_head() {
        let s = Session::new("s1", bus());
        let chatter = InboxItem::speech("chatter", false, 0, token());
        s.enqueue(chatter.clone());
        chatter.set_processing(true);

        s.enqueue(InboxItem::speech("urgent", true, 1, token()));
        assert_eq!(s.peek_inbox().unwrap().text, "chatter");
    }

    #[tokio::test]
    async fn peek_pops_done_heads() {
        let s = Session::new("s1", bus());
        let first = InboxItem::choices("q1", vec![], token());
        s.enqueue(first.clone());
        s.enqueue(InboxItem::choices("q2", vec![], token()));

        first.resolve(json!({"selected": "a"}));
        assert_eq!(s.peek_inbox().unwrap().preamble, "q2");
        assert_eq!(s.done_log_len(), 1);
    }

    #[tokio::test]
    async fn peek_drains_all_consecutive_orphans() {
        let s = Session::new("s1", bus());
        let owner = token();
        let items: Vec<_> = (0..3)
            .map(|i| {
                let item = InboxItem::choices(&format!("q{i}"), vec![], owner.clone());
                s.enqueue(item.clone());
                item
            })
            .collect();

        owner.cancel();
        assert!(s.peek_inbox().is_none());
        assert_eq!(s.inbox_len(), 0);
        for item in items {
            assert!(item.is_done());
            assert!(item.latch_signalled());
            assert_eq!(item.result().unwrap()["selected"], sentinel::RESTART);
        }
    }

    #[tokio::test]
    async fn orphan_drain_stops_at_live_owner() {
        let s = Session::new("s1", bus());
        let dead = token();
        s.enqueue(InboxItem::choices("dead1", vec![], dead.clone()));
        s.enqueue(InboxItem::choices("dead2", vec![], dead.clone()));
        s.enqueue(InboxItem::choices("alive", vec![], token()));
        dead.cancel();

        let head = s.peek_inbox().unwrap();
        assert_eq!(head.preamble, "alive");
        assert_eq!(s.inbox_len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_pending_resolves_everything() {
        let s = Session::new("s1", bus());
        let items: Vec<_> = (0..3)
            .map(|i| {
                let item = InboxItem::choices(&format!("q{i}"), vec![], token());
                s.enqueue(item.clone());
                item
            })
            .collect();

        let active = items[0].clone();
        s.set_active_presentation(&active);
        s.cancel_all_pending();

        assert_eq!(s.inbox_len(), 0);
        assert!(!s.has_active_choices());
        for item in items {
            assert_eq!(item.result().unwrap()["selected"], sentinel::CANCELLED);
            assert!(item.latch_signalled());
        }
    }

    #[tokio::test]
    async fn done_log_is_capped() {
        let s = Session::new("s1", bus());
        for i in 0..(DONE_LOG_CAP + 25) {
            let item = InboxItem::choices(&format!("q{i}"), vec![], token());
            s.enqueue(item.clone());
            item.resolve(json!({"selected": "x"}));
            s.peek_inbox();
        }
        assert_eq!(s.done_log_len(), DONE_LOG_CAP);
    }

    #[tokio::test]
    async fn speech_log_is_capped() {
        let s = Session::new("s1", bus());
        for i in 0..(SPEECH_LOG_CAP + 10) {
            s.record_speech(&format!("line {i}"), true);
        }
        assert_eq!(s.speech_log_len(), SPEECH_LOG_CAP);
    }

    #[test]
    fn undo_stack_caps_and_mirrors() {
        let s = Session::new("s1", bus());
        for i in 0..7 {
            s.push_undo(UndoEntry {
                preamble: format!("q{i}"),
                choices: vec![Choice::new(&format!("c{i}"), "")],
                selection: format!("c{i}"),
            });
        }
        assert_eq!(s.undo_depth(), UNDO_CAP);
        let (preamble, _) = s.last_presentation();
        assert_eq!(preamble, "q6");

        let popped = s.pop_undo().unwrap();
        assert_eq!(popped.preamble, "q6");
        let (preamble, _) = s.last_presentation();
        assert_eq!(preamble, "q5");
    }

    #[test]
    fn pop_undo_round_trips_mirror_fields() {
        let s = Session::new("s1", bus());
        s.push_undo(UndoEntry {
            preamble: "first".into(),
            choices: vec![],
            selection: "a".into(),
        });
        let (before_preamble, before_choices) = s.last_presentation();

        s.push_undo(UndoEntry {
            preamble: "second".into(),
            choices: vec![Choice::new("b", "")],
            selection: "b".into(),
        });
        s.pop_undo();

        let (after_preamble, after_choices) = s.last_presentation();
        assert_eq!(after_preamble, before_preamble);
        assert_eq!(after_choices, before_choices);
    }

    #[test]
    fn popping_last_undo_clears_mirrors() {
        let s = Session::new("s1", bus());
        s.push_undo(UndoEntry {
            preamble: "only".into(),
            choices: vec![Choice::new("a", "")],
            selection: "a".into(),
        });
        s.pop_undo();
        let (preamble, choices) = s.last_presentation();
        assert!(preamble.is_empty());
        assert!(choices.is_empty());
        assert!(s.pop_undo().is_none());
    }

    #[tokio::test]
    async fn messages_drain_into_flushed() {
        let s = Session::new("s1", bus());
        assert_eq!(s.queue_message("check auth.py"), 1);
        assert_eq!(s.queue_message("also tests"), 2);

        let drained = s.drain_messages();
        assert_eq!(drained, vec!["check auth.py", "also tests"]);
        assert_eq!(s.pending_message_count(), 0);
        assert_eq!(s.flushed_messages().len(), 2);
        assert!(s.drain_messages().is_empty());
    }

    #[tokio::test]
    async fn touch_resets_health() {
        let s = Session::new("s1", bus());
        s.set_health_status(HealthStatus::Warning);
        assert_eq!(s.health_status(), HealthStatus::Warning);

        s.touch("speak");
        assert_eq!(s.health_status(), HealthStatus::Healthy);
        assert_eq!(s.tool_call_count(), 1);
        assert_eq!(s.last_tool_name(), "speak");
    }

    #[tokio::test]
    async fn health_transition_reports_fresh_alert_once() {
        let s = Session::new("s1", bus());
        assert!(s.set_health_status(HealthStatus::Warning));
        assert!(!s.set_health_status(HealthStatus::Warning));
        // Escalation after the first alert is not fresh either.
        assert!(!s.set_health_status(HealthStatus::Unresponsive));
    }
}
