// Dispatcher-level flows: concurrent agents, message delivery, the undo
// sentinel, error shaping, and the registration reminder.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use earshot_broker::{ToolDispatcher, ToolInvocation};
use earshot_core::config::{EarshotConfig, ExtraOption};
use earshot_core::event::EventBus;
use earshot_proc::Supervisor;
use earshot_sessions::{sentinel, Choice, CollabError, Collaborator, Session, SessionManager};
use earshot_tts::TtsEngine;

/// Records every presentation and blocks until the test scripts an answer.
struct RecordingOperator {
    presented: Mutex<Vec<(String, String, Vec<Choice>)>>,
    answers: Mutex<HashMap<String, VecDeque<Value>>>,
}

impl RecordingOperator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            presented: Mutex::new(Vec::new()),
            answers: Mutex::new(HashMap::new()),
        })
    }

    fn answer(&self, session_id: &str, value: Value) {
        self.answers
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push_back(value);
    }

    async fn take_answer(&self, session_id: &str) -> Value {
        loop {
            if let Some(v) = self
                .answers
                .lock()
                .unwrap()
                .get_mut(session_id)
                .and_then(|q| q.pop_front())
            {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn presentations_for(&self, session_id: &str) -> usize {
        self.presented
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == session_id)
            .count()
    }

    fn last_choices(&self, session_id: &str) -> Vec<Choice> {
        self.presented
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _, _)| id == session_id)
            .map(|(_, _, c)| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Collaborator for RecordingOperator {
    async fn present_choices(
        &self,
        session: Arc<Session>,
        preamble: &str,
        choices: &[Choice],
    ) -> Result<Value, CollabError> {
        self.presented.lock().unwrap().push((
            session.session_id.clone(),
            preamble.to_string(),
            choices.to_vec(),
        ));
        Ok(self.take_answer(&session.session_id).await)
    }

    async fn present_multi_select(
        &self,
        session: Arc<Session>,
        preamble: &str,
        choices: &[Choice],
    ) -> Result<Value, CollabError> {
        self.presented.lock().unwrap().push((
            session.session_id.clone(),
            preamble.to_string(),
            choices.to_vec(),
        ));
        Ok(self.take_answer(&session.session_id).await)
    }

    async fn speak_blocking(&self, _session: Arc<Session>, _text: &str) -> Result<(), CollabError> {
        Ok(())
    }
}

struct Harness {
    dispatcher: Arc<ToolDispatcher>,
    manager: Arc<SessionManager>,
    operator: Arc<RecordingOperator>,
}

fn harness_with_config(mut cfg: EarshotConfig) -> Harness {
    cfg.tts.binary = vec!["/nonexistent/earshot-tts-test".to_string()];
    cfg.tts.player = vec!["true".to_string()];
    cfg.tts.cache_dir = std::env::temp_dir()
        .join("earshot-broker-test-cache")
        .display()
        .to_string();
    let config = Arc::new(RwLock::new(cfg));

    let bus = Arc::new(EventBus::new());
    let manager = Arc::new(SessionManager::new(
        bus.clone(),
        std::env::temp_dir().join("earshot-broker-test-sessions.json"),
    ));
    let tts = TtsEngine::new(config.clone(), Arc::new(Supervisor::new()));
    let operator = RecordingOperator::new();
    let dispatcher = Arc::new(ToolDispatcher::new(
        manager.clone(),
        bus.clone(),
        tts,
        operator.clone(),
        config,
        None,
    ));
    Harness {
        dispatcher,
        manager,
        operator,
    }
}

fn harness() -> Harness {
    harness_with_config(EarshotConfig::default())
}

fn choices_args(preamble: &str, labels: &[&str]) -> Value {
    json!({
        "preamble": preamble,
        "choices": labels.iter().map(|l| json!({"label": l, "summary": ""})).collect::<Vec<_>>(),
    })
}

async fn register(h: &Harness, session_id: &str) {
    h.dispatcher
        .dispatch(ToolInvocation::new(
            "register_session",
            json!({"cwd": "/src", "name": session_id}),
            session_id,
        ))
        .await;
}

#[tokio::test]
async fn concurrent_agents_resolve_without_cross_talk() {
    let h = harness();
    register(&h, "a").await;
    register(&h, "b").await;

    let da = h.dispatcher.clone();
    let task_a = tokio::spawn(async move {
        da.dispatch(ToolInvocation::new(
            "present_choices",
            choices_args("Pick A", &["x", "y"]),
            "a",
        ))
        .await
    });
    let db = h.dispatcher.clone();
    let task_b = tokio::spawn(async move {
        db.dispatch(ToolInvocation::new(
            "present_choices",
            choices_args("Pick B", &["p", "q"]),
            "b",
        ))
        .await
    });

    // Operator handles "a" first.
    h.operator.answer("a", json!({"selected": "y", "summary": ""}));
    let response_a: Value = serde_json::from_str(&task_a.await.unwrap()).unwrap();
    assert_eq!(response_a["selected"], "y");
    assert!(!task_b.is_finished(), "b must still be blocked");

    h.operator.answer("b", json!({"selected": "p", "summary": ""}));
    let response_b: Value = serde_json::from_str(&task_b.await.unwrap()).unwrap();
    assert_eq!(response_b["selected"], "p");
}

#[tokio::test]
async fn pending_messages_merge_into_json_and_text_responses() {
    let h = harness();
    register(&h, "a").await;
    let session = h.manager.get("a").unwrap();

    // Queued while the agent was busy.
    session.queue_message("check auth.py");
    h.operator.answer("a", json!({"selected": "x", "summary": ""}));
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "present_choices",
            choices_args("Q", &["x"]),
            "a",
        ))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["user_messages"][0], "check auth.py");
    assert_eq!(session.pending_message_count(), 0);

    // Plain-text responses get a readable suffix instead.
    session.queue_message("also run the tests");
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "speak_async",
            json!({"text": "done"}),
            "a",
        ))
        .await;
    assert!(response.starts_with("Spoke: done"));
    assert!(response.contains("also run the tests"));
}

#[tokio::test]
async fn unregistered_sessions_get_reminder_suffix() {
    let h = harness();
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "speak_async",
            json!({"text": "hi"}),
            "anon",
        ))
        .await;
    assert!(response.contains("register_session"));

    register(&h, "anon").await;
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "speak_async",
            json!({"text": "hi again"}),
            "anon",
        ))
        .await;
    assert!(!response.contains("REMINDER"));
}

#[tokio::test]
async fn undo_sentinel_is_consumed_and_represented() {
    let h = harness();
    register(&h, "a").await;

    h.operator.answer("a", json!({"selected": sentinel::UNDO}));
    h.operator.answer("a", json!({"selected": "x", "summary": ""}));

    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "present_choices",
            choices_args("Q", &["x", "y"]),
            "a",
        ))
        .await;

    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["selected"], "x");
    // The same presentation ran twice; the sentinel never reached the agent.
    assert_eq!(h.operator.presentations_for("a"), 2);
    assert!(!response.contains(sentinel::UNDO));
}

#[tokio::test]
async fn empty_choices_short_circuit() {
    let h = harness();
    register(&h, "a").await;
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "present_choices",
            json!({"preamble": "Q", "choices": []}),
            "a",
        ))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["selected"], "error");

    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "present_multi_select",
            json!({"preamble": "Q", "choices": []}),
            "a",
        ))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["selected"], json!([]));
}

#[tokio::test]
async fn config_extra_options_are_appended_once() {
    let mut cfg = EarshotConfig::default();
    cfg.extra_options = vec![
        ExtraOption {
            label: "Continue".to_string(),
            summary: "Keep going".to_string(),
            silent: false,
        },
        ExtraOption {
            label: "x".to_string(),
            summary: "duplicate of a real choice".to_string(),
            silent: true,
        },
    ];
    let h = harness_with_config(cfg);
    register(&h, "a").await;

    h.operator.answer("a", json!({"selected": "x", "summary": ""}));
    h.dispatcher
        .dispatch(ToolInvocation::new(
            "present_choices",
            choices_args("Q", &["x", "y"]),
            "a",
        ))
        .await;

    let presented = h.operator.last_choices("a");
    let labels: Vec<&str> = presented.iter().map(|c| c.label.as_str()).collect();
    // "Continue" appended, duplicate "x" skipped case-insensitively.
    assert_eq!(labels, ["x", "y", "Continue"]);
}

#[tokio::test]
async fn unknown_tool_returns_stable_error_shape() {
    let h = harness();
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new("frobnicate", json!({}), "a"))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert!(parsed["error"]
        .as_str()
        .unwrap()
        .starts_with("UnknownTool:"));
    assert_eq!(parsed["tool"], "frobnicate");
    assert!(parsed["suggestion"].as_str().unwrap().contains("get_logs"));
}

#[tokio::test]
async fn missing_arguments_return_stable_error_shape() {
    let h = harness();
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new("speak", json!({}), "a"))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert!(parsed["error"]
        .as_str()
        .unwrap()
        .starts_with("InvalidArguments:"));
}

#[tokio::test]
async fn run_command_denied_does_not_execute() {
    let h = harness();
    register(&h, "a").await;
    h.operator.answer("a", json!({"selected": "Deny", "summary": ""}));

    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "run_command",
            json!({"command": "echo hi"}),
            "a",
        ))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["status"], "denied");
}

#[tokio::test]
async fn run_command_approved_returns_output() {
    let h = harness();
    register(&h, "a").await;
    h.operator.answer("a", json!({"selected": "Approve", "summary": ""}));

    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "run_command",
            json!({"command": "echo hello-from-earshot"}),
            "a",
        ))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["status"], "completed");
    assert_eq!(parsed["returncode"], 0);
    assert!(parsed["stdout"].as_str().unwrap().contains("hello-from-earshot"));
}

#[tokio::test]
async fn speak_returns_truncated_preview() {
    let h = harness();
    register(&h, "a").await;
    let long = "x".repeat(150);
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new("speak", json!({"text": long}), "a"))
        .await;
    assert!(response.starts_with("Spoke: "));
    assert!(response.contains("..."));
}

#[tokio::test]
async fn registration_returns_identity_and_features() {
    let h = harness();
    let response = h
        .dispatcher
        .dispatch(ToolInvocation::new(
            "register_session",
            json!({"cwd": "/src", "name": "Builder", "hostname": ""}),
            "s1",
        ))
        .await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["status"], "registered");
    assert_eq!(parsed["session_id"], "s1");
    assert_eq!(parsed["name"], "Builder");
    assert_eq!(parsed["is_local"], true);
    let features = parsed["features"].as_array().unwrap();
    assert!(features.iter().any(|f| f == "present_choices"));
    assert!(h.manager.get("s1").unwrap().is_registered());
}

#[tokio::test]
async fn abandoned_caller_items_resolve_restart_on_peek() {
    let h = harness();
    register(&h, "s").await;
    let session = h.manager.get("s").unwrap();

    // Occupy the drain loop so queued items stay untouched behind the head.
    let blocker = h.dispatcher.clone();
    let blocker_task = tokio::spawn(async move {
        blocker
            .dispatch(ToolInvocation::new(
                "present_choices",
                choices_args("head", &["h"]),
                "s",
            ))
            .await
    });
    while session.inbox_len() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Three callers enqueue and then die without ever being presented.
    let mut doomed = Vec::new();
    for i in 0..3 {
        let d = h.dispatcher.clone();
        doomed.push(tokio::spawn(async move {
            d.dispatch(ToolInvocation::new(
                "present_choices",
                choices_args(&format!("doomed {i}"), &["a"]),
                "s",
            ))
            .await
        }));
    }
    while session.inbox_len() < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for task in &doomed {
        task.abort();
    }
    // Give the aborts time to drop the owner guards.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Unblock the head; the drain loop's next peek sweeps all three orphans.
    h.operator.answer("s", json!({"selected": "h", "summary": ""}));
    blocker_task.await.unwrap();

    while session.inbox_len() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(session.inbox_len(), 0);
    // Head + three orphans all live in the done log.
    assert_eq!(session.done_log_len(), 4);
}
