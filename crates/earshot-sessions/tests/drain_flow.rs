// Drain-loop behaviour with a scripted operator: concurrent sessions resolve
// independently, collaborator failures force-resolve, and blocking speech
// lands in the speech log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use earshot_core::config::EarshotConfig;
use earshot_core::event::EventBus;
use earshot_proc::Supervisor;
use earshot_sessions::{
    drain, sentinel, Choice, CollabError, Collaborator, InboxItem, Session, SessionManager,
};
use earshot_tts::TtsEngine;

/// Operator stand-in: present_choices blocks until the test scripts an
/// answer for that session, mimicking a human who answers one question at a
/// time.
struct ScriptedOperator {
    responses: Mutex<HashMap<String, VecDeque<Value>>>,
}

impl ScriptedOperator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
        })
    }

    fn answer(&self, session_id: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push_back(value);
    }

    fn pop(&self, session_id: &str) -> Option<Value> {
        self.responses
            .lock()
            .unwrap()
            .get_mut(session_id)?
            .pop_front()
    }

    async fn next_answer(&self, session_id: &str) -> Value {
        loop {
            if let Some(v) = self.pop(session_id) {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Collaborator for ScriptedOperator {
    async fn present_choices(
        &self,
        session: Arc<Session>,
        _preamble: &str,
        _choices: &[Choice],
    ) -> Result<Value, CollabError> {
        Ok(self.next_answer(&session.session_id).await)
    }

    async fn present_multi_select(
        &self,
        session: Arc<Session>,
        _preamble: &str,
        _choices: &[Choice],
    ) -> Result<Value, CollabError> {
        Ok(self.next_answer(&session.session_id).await)
    }

    async fn speak_blocking(&self, _session: Arc<Session>, _text: &str) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Collaborator whose presentation always blows up.
struct BrokenUi;

#[async_trait]
impl Collaborator for BrokenUi {
    async fn present_choices(
        &self,
        _session: Arc<Session>,
        _preamble: &str,
        _choices: &[Choice],
    ) -> Result<Value, CollabError> {
        Err(CollabError::Failed("widget tree gone".to_string()))
    }

    async fn present_multi_select(
        &self,
        _session: Arc<Session>,
        _preamble: &str,
        _choices: &[Choice],
    ) -> Result<Value, CollabError> {
        Err(CollabError::Failed("widget tree gone".to_string()))
    }

    async fn speak_blocking(&self, _session: Arc<Session>, _text: &str) -> Result<(), CollabError> {
        Err(CollabError::Failed("audio device gone".to_string()))
    }
}

fn silent_tts() -> Arc<TtsEngine> {
    // Nonexistent synthesis binary: prompts fall through the suppression
    // path without touching audio hardware.
    let mut cfg = EarshotConfig::default();
    cfg.tts.binary = vec!["/nonexistent/earshot-tts-test".to_string()];
    cfg.tts.player = vec!["true".to_string()];
    cfg.tts.cache_dir = std::env::temp_dir()
        .join("earshot-drain-test-cache")
        .display()
        .to_string();
    TtsEngine::new(Arc::new(RwLock::new(cfg)), Arc::new(Supervisor::new()))
}

struct Harness {
    manager: Arc<SessionManager>,
    bus: Arc<EventBus>,
    tts: Arc<TtsEngine>,
}

fn harness() -> Harness {
    let bus = Arc::new(EventBus::new());
    let manager = Arc::new(SessionManager::new(
        bus.clone(),
        std::env::temp_dir().join("earshot-drain-test.json"),
    ));
    Harness {
        manager,
        bus: bus.clone(),
        tts: silent_tts(),
    }
}

fn start_session(h: &Harness, id: &str, collab: Arc<dyn Collaborator>) -> Arc<Session> {
    let (session, created) = h.manager.get_or_create(id);
    assert!(created);
    drain::spawn(session.clone(), collab, h.tts.clone(), h.bus.clone());
    session
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..400 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn concurrent_sessions_resolve_independently() {
    let h = harness();
    let operator = ScriptedOperator::new();
    let a = start_session(&h, "a", operator.clone());
    let b = start_session(&h, "b", operator.clone());

    let item_a = InboxItem::choices(
        "Pick A",
        vec![Choice::new("x", ""), Choice::new("y", "")],
        CancellationToken::new(),
    );
    let item_b = InboxItem::choices(
        "Pick B",
        vec![Choice::new("p", ""), Choice::new("q", "")],
        CancellationToken::new(),
    );
    a.enqueue(item_a.clone());
    b.enqueue(item_b.clone());

    // Operator answers session "a" first.
    operator.answer("a", json!({"selected": "y", "summary": ""}));
    wait_until(|| item_a.is_done()).await;

    assert_eq!(item_a.result().unwrap()["selected"], "y");
    assert!(!item_b.is_done(), "b must stay blocked until its own answer");

    operator.answer("b", json!({"selected": "p", "summary": ""}));
    wait_until(|| item_b.is_done()).await;
    assert_eq!(item_b.result().unwrap()["selected"], "p");

    // No cross-resolution and both inboxes drained.
    assert_eq!(a.inbox_len(), 0);
    assert_eq!(b.inbox_len(), 0);
    assert_eq!(a.done_log_len(), 1);
    assert_eq!(b.done_log_len(), 1);
}

#[tokio::test]
async fn selection_records_history_and_undo() {
    let h = harness();
    let operator = ScriptedOperator::new();
    let s = start_session(&h, "s", operator.clone());
    let mut sub = h.bus.subscribe();

    let item = InboxItem::choices(
        "Deploy?",
        vec![Choice::new("yes", "ship it"), Choice::new("no", "")],
        CancellationToken::new(),
    );
    s.enqueue(item.clone());
    operator.answer("s", json!({"selected": "yes", "summary": "ship it"}));
    wait_until(|| item.is_done()).await;

    assert_eq!(s.history_len(), 1);
    assert_eq!(s.undo_depth(), 1);
    let (preamble, choices) = s.last_presentation();
    assert_eq!(preamble, "Deploy?");
    assert_eq!(choices.len(), 2);

    wait_until(|| {
        std::iter::from_fn(|| sub.rx.try_recv().ok()).any(|e| e.event_type == "selection_made")
    })
    .await;
}

#[tokio::test]
async fn sentinel_selection_skips_history_and_undo() {
    let h = harness();
    let operator = ScriptedOperator::new();
    let s = start_session(&h, "s", operator.clone());

    let item = InboxItem::choices("Pick", vec![Choice::new("a", "")], CancellationToken::new());
    s.enqueue(item.clone());
    operator.answer("s", json!({"selected": sentinel::SKIP, "summary": ""}));
    wait_until(|| item.is_done()).await;

    assert_eq!(s.history_len(), 0);
    assert_eq!(s.undo_depth(), 0);
}

#[tokio::test]
async fn broken_collaborator_force_resolves_and_keeps_draining() {
    let h = harness();
    let s = start_session(&h, "s", Arc::new(BrokenUi));

    let first = InboxItem::choices("q1", vec![Choice::new("a", "")], CancellationToken::new());
    let second = InboxItem::speech("status line", true, 0, CancellationToken::new());
    let third = InboxItem::choices("q3", vec![Choice::new("b", "")], CancellationToken::new());
    s.enqueue(first.clone());
    s.enqueue(second.clone());
    s.enqueue(third.clone());

    wait_until(|| third.is_done()).await;

    assert_eq!(first.result().unwrap()["selected"], sentinel::CANCELLED);
    assert_eq!(second.result().unwrap()["selected"], sentinel::SPEECH_DONE);
    assert_eq!(third.result().unwrap()["selected"], sentinel::CANCELLED);
    assert_eq!(s.inbox_len(), 0);
    assert_eq!(s.done_log_len(), 3);
}

#[tokio::test]
async fn blocking_speech_resolves_and_logs() {
    let h = harness();
    let operator = ScriptedOperator::new();
    let s = start_session(&h, "s", operator);

    let item = InboxItem::speech("build finished", true, 0, CancellationToken::new());
    s.enqueue(item.clone());
    wait_until(|| item.is_done()).await;

    assert_eq!(item.result().unwrap()["selected"], sentinel::SPEECH_DONE);
    assert!(item.latch_signalled());
    assert_eq!(s.speech_log_len(), 1);
}

#[tokio::test]
async fn removing_session_stops_its_drain_loop() {
    let h = harness();
    let operator = ScriptedOperator::new();
    let s = start_session(&h, "s", operator.clone());

    h.manager.remove("s");
    assert!(s.closed.is_cancelled());

    // Items enqueued after removal are no longer served.
    let item = InboxItem::choices("late", vec![], CancellationToken::new());
    s.enqueue(item.clone());
    operator.answer("s", json!({"selected": "a"}));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!item.is_done());
}
