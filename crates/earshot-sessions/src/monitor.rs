//! Health monitor: a periodic sweep that classifies idle agents and cleans
//! up sessions whose process is gone.
//!
//! Sessions with choices on screen are never flagged: the agent is waiting
//! on the operator, not stuck.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use earshot_core::config::HealthConfig;
use earshot_core::event::{EventBus, FrontendEvent};

use crate::collab::Collaborator;
use crate::manager::SessionManager;
use crate::session::{HealthStatus, Session};

/// Liveness oracle for the process a session registered (tmux pane, PID…).
/// `None` means the session carries no locator at all.
pub trait ProcessProbe: Send + Sync {
    fn alive(&self, session: &Arc<Session>) -> Option<bool>;
}

/// Default probe: a `pid` metadata key checked against the local process
/// table. Sessions without one are unprobeable.
pub struct PidProbe;

impl ProcessProbe for PidProbe {
    fn alive(&self, session: &Arc<Session>) -> Option<bool> {
        let pid = session
            .metadata_value("pid")
            .and_then(|v| v.as_i64())
            .filter(|pid| *pid > 0)?;
        Some(earshot_core::diag::pid_alive(pid as i32))
    }
}

pub struct HealthMonitor {
    manager: Arc<SessionManager>,
    bus: Arc<EventBus>,
    collab: Arc<dyn Collaborator>,
    probe: Arc<dyn ProcessProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<SessionManager>,
        bus: Arc<EventBus>,
        collab: Arc<dyn Collaborator>,
        probe: Arc<dyn ProcessProbe>,
        config: HealthConfig,
    ) -> Self {
        Self {
            manager,
            bus,
            collab,
            probe,
            config,
        }
    }

    /// Periodic sweep until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = self.config.check_interval_secs,
            "health monitor started"
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep(),
                _ = shutdown.cancelled() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all sessions. Split out from `run` so state transitions
    /// are directly drivable.
    pub fn sweep(&self) {
        let now = earshot_core::epoch_now();
        for session in self.manager.all_sessions() {
            if session.has_active_choices() {
                continue;
            }
            let elapsed = now - session.last_tool_call();

            let status = if elapsed >= self.config.unresponsive_secs as f64 {
                HealthStatus::Unresponsive
            } else if elapsed >= self.config.warning_secs as f64 {
                HealthStatus::Warning
            } else {
                HealthStatus::Healthy
            };

            let fresh_alert = session.set_health_status(status);
            if fresh_alert {
                let event_type = match status {
                    HealthStatus::Warning => "health_warning",
                    HealthStatus::Unresponsive => "health_unresponsive",
                    HealthStatus::Healthy => unreachable!(),
                };
                warn!(session_id = %session.session_id, elapsed, ?status, "agent health degraded");
                self.bus.publish(FrontendEvent::new(
                    event_type,
                    json!({"name": session.name(), "elapsed_seconds": elapsed}),
                    &session.session_id,
                ));
            }

            if self.should_auto_clean(&session, elapsed) {
                self.cleanup_dead_session(&session);
            }
        }
    }

    /// A session is cleaned up when it is not focused AND either its
    /// registered process is observed dead past the warning window, or it has
    /// no process locator at all and sat idle past the unresponsive window.
    fn should_auto_clean(&self, session: &Arc<Session>, elapsed: f64) -> bool {
        if self.manager.focused_id().as_deref() == Some(session.session_id.as_str()) {
            return false;
        }
        match self.probe.alive(session) {
            Some(false) => elapsed > self.config.warning_secs as f64,
            Some(true) => false,
            None => elapsed >= self.config.unresponsive_secs as f64,
        }
    }

    fn cleanup_dead_session(&self, session: &Arc<Session>) {
        info!(session_id = %session.session_id, name = %session.name(), "cleaning up dead session");
        session.cancel_all_pending();
        self.collab.on_session_removed(&session.session_id);
        self.manager.remove(&session.session_id);
    }
}
