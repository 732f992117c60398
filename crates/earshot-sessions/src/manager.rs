//! Registry of live sessions: lookup map plus insertion order for tab
//! navigation, the focus pointer, stale cleanup, and registered-session
//! persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use earshot_core::event::EventBus;

use crate::persist::{self, PersistedSession};
use crate::session::{HealthStatus, Session, SessionInfo};

struct ManagerState {
    map: HashMap<String, Arc<Session>>,
    /// Insertion order; shares exactly the map's keys.
    order: Vec<String>,
    focused: Option<String>,
    /// Records loaded at startup, awaiting a matching registration.
    restorable: Vec<PersistedSession>,
}

pub struct SessionManager {
    inner: Mutex<ManagerState>,
    bus: Arc<EventBus>,
    persist_path: PathBuf,
}

impl SessionManager {
    pub fn new(bus: Arc<EventBus>, persist_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(ManagerState {
                map: HashMap::new(),
                order: Vec::new(),
                focused: None,
                restorable: Vec::new(),
            }),
            bus,
            persist_path: persist_path.into(),
        }
    }

    /// Look up or create a session. Returns `(session, created)`.
    pub fn get_or_create(&self, session_id: &str) -> (Arc<Session>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.map.get(session_id) {
            return (session.clone(), false);
        }
        let session = Session::new(session_id, self.bus.clone());
        inner.map.insert(session_id.to_string(), session.clone());
        inner.order.push(session_id.to_string());
        debug!(session_id, "session created");
        (session, true)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().map.get(session_id).cloned()
    }

    /// Remove a session: focus moves off it, its drain loop is stopped, and
    /// `session_removed` is published.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            let session = inner.map.remove(session_id)?;
            inner.order.retain(|id| id != session_id);
            if inner.focused.as_deref() == Some(session_id) {
                inner.focused = inner.order.first().cloned();
            }
            session
        };
        session.closed.cancel();
        self.bus
            .emit_session_removed(session_id, &session.name());
        info!(session_id, "session removed");
        Some(session)
    }

    /// Focus an existing session; unknown ids are ignored.
    pub fn focus(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(session_id) {
            inner.focused = Some(session_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn focused(&self) -> Option<Arc<Session>> {
        let inner = self.inner.lock().unwrap();
        inner
            .focused
            .as_ref()
            .and_then(|id| inner.map.get(id))
            .cloned()
    }

    pub fn focused_id(&self) -> Option<String> {
        self.inner.lock().unwrap().focused.clone()
    }

    /// Move focus to the next tab in insertion order (wrapping).
    pub fn next_tab(&self) -> Option<Arc<Session>> {
        self.step_tab(1)
    }

    /// Move focus to the previous tab in insertion order (wrapping).
    pub fn prev_tab(&self) -> Option<Arc<Session>> {
        self.step_tab(-1)
    }

    fn step_tab(&self, delta: isize) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.order.is_empty() {
            return None;
        }
        let len = inner.order.len() as isize;
        let current = inner
            .focused
            .as_ref()
            .and_then(|id| inner.order.iter().position(|o| o == id))
            .map(|i| i as isize)
            .unwrap_or(-delta);
        let next = ((current + delta) % len + len) % len;
        let id = inner.order[next as usize].clone();
        inner.focused = Some(id.clone());
        inner.map.get(&id).cloned()
    }

    /// Focus the next session (after the current one) that has choices
    /// awaiting the operator. Returns `None` when nobody is waiting.
    pub fn next_with_choices(&self) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.order.is_empty() {
            return None;
        }
        let len = inner.order.len();
        let start = inner
            .focused
            .as_ref()
            .and_then(|id| inner.order.iter().position(|o| o == id))
            .map(|i| i + 1)
            .unwrap_or(0);
        for offset in 0..len {
            let id = inner.order[(start + offset) % len].clone();
            if let Some(session) = inner.map.get(&id) {
                if session.has_active_choices() {
                    let session = session.clone();
                    inner.focused = Some(id);
                    return Some(session);
                }
            }
        }
        None
    }

    /// Sessions in tab (insertion) order.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.map.get(id))
            .cloned()
            .collect()
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        self.all_sessions().iter().map(|s| s.info()).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// One segment per session, with a status glyph: `●` while choices are
    /// active (masking health: the agent is waiting on the operator, not
    /// stuck), else `⚠`/`✗` for warning/unresponsive.
    pub fn tab_bar_text(&self) -> String {
        let sessions = self.all_sessions();
        let segments: Vec<String> = sessions
            .iter()
            .enumerate()
            .map(|(i, session)| {
                let info = session.info();
                let glyph = if info.active {
                    "●"
                } else {
                    match info.health {
                        HealthStatus::Warning => "⚠",
                        HealthStatus::Unresponsive => "✗",
                        HealthStatus::Healthy => "",
                    }
                };
                format!("{}:{}{}", i + 1, info.name, glyph)
            })
            .collect();
        segments.join("  ")
    }

    /// Remove sessions idle past `timeout_secs`, skipping the focused session
    /// and any session with choices on screen. Returns the removed ids.
    pub fn cleanup_stale(&self, timeout_secs: u64) -> Vec<String> {
        let now = earshot_core::epoch_now();
        let stale: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .order
                .iter()
                .filter(|id| {
                    if inner.focused.as_deref() == Some(id.as_str()) {
                        return false;
                    }
                    let Some(session) = inner.map.get(*id) else {
                        return false;
                    };
                    if session.has_active_choices() {
                        return false;
                    }
                    now - session.last_activity() > timeout_secs as f64
                })
                .cloned()
                .collect()
        };
        for id in &stale {
            if let Some(session) = self.remove(id) {
                session.cancel_all_pending();
            }
        }
        stale
    }

    // --- persistence -------------------------------------------------------

    /// Persist the registered sessions' metadata and recent activity.
    pub fn save_registered(&self) -> crate::Result<()> {
        let records: Vec<PersistedSession> = self
            .all_sessions()
            .iter()
            .filter(|s| s.is_registered())
            .map(|s| s.to_persisted())
            .collect();
        persist::save(&self.persist_path, &records)
    }

    /// Load persisted records and stage them for restoration; returns how
    /// many were loaded.
    pub fn load_registered(&self) -> usize {
        let records = persist::load(&self.persist_path);
        let count = records.len();
        self.inner.lock().unwrap().restorable = records;
        count
    }

    /// After registration, rehydrate the session from a staged record with
    /// the same `name` + `cwd`. Each record restores at most once.
    pub fn restore_if_known(&self, session: &Arc<Session>) -> bool {
        let info = session.info();
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner
                .restorable
                .iter()
                .position(|r| r.name == info.name && r.cwd == info.cwd);
            idx.map(|i| inner.restorable.remove(i))
        };
        match record {
            Some(record) => {
                session.restore_activity(&record);
                info!(session_id = %session.session_id, name = %info.name, "session activity restored");
                true
            }
            None => false,
        }
    }
}
