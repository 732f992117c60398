//! Circuit breaker for the remote synthesis path.
//!
//! Three consecutive failures open the circuit; while open, synthesis calls
//! short-circuit and the operator hears a throttled error chime instead of
//! silence. After the cooldown a single recovery probe decides whether to
//! close the circuit again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub const FAIL_THRESHOLD: u32 = 3;
pub const COOLDOWN: Duration = Duration::from_secs(60);
/// Minimum spacing between audible suppression chimes.
pub const SUPPRESSION_CHIME_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot returned by `api_health()`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiHealth {
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub cooldown_remaining_seconds: f64,
    pub probe_in_progress: bool,
}

struct BreakerState {
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    last_error: Option<String>,
    last_suppression_chime: Option<Instant>,
}

pub struct CircuitBreaker {
    fail_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
    probe_in_progress: AtomicBool,
}

/// Single-flight token for a recovery probe. Dropping it (normally in the
/// probe's cleanup path) re-arms probing.
pub struct ProbeGuard {
    breaker: Arc<CircuitBreaker>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.breaker.probe_in_progress.store(false, Ordering::SeqCst);
    }
}

impl CircuitBreaker {
    pub fn new(fail_threshold: u32, cooldown: Duration) -> Self {
        Self {
            fail_threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                last_failure_time: None,
                last_error: None,
                last_suppression_chime: None,
            }),
            probe_in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FAIL_THRESHOLD, COOLDOWN)
    }

    /// Record a generation failure. `None` keeps the previous error text.
    pub fn record_failure(&self, reason: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        state.last_failure_time = Some(Instant::now());
        if let Some(reason) = reason {
            state.last_error = Some(reason.to_string());
        }
    }

    /// Record a successful generation: counters reset, error cleared.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.last_failure_time = None;
        state.last_error = None;
    }

    /// Full reset, including any stuck probe flag.
    pub fn reset(&self) {
        self.record_success();
        self.probe_in_progress.store(false, Ordering::SeqCst);
    }

    /// Closed circuit: remote generation may be attempted.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().consecutive_failures < self.fail_threshold
    }

    /// When the circuit is open and the cooldown has elapsed, claim the
    /// single probe slot. Exactly one caller gets a guard even under
    /// concurrent checks; the flag is set inside this critical section and
    /// cleared by the guard's drop in the probe itself.
    pub fn try_begin_probe(self: &Arc<Self>) -> Option<ProbeGuard> {
        {
            let state = self.state.lock().unwrap();
            if state.consecutive_failures < self.fail_threshold {
                return None;
            }
            let elapsed = state.last_failure_time.map(|t| t.elapsed());
            if !elapsed.is_some_and(|e| e >= self.cooldown) {
                return None;
            }
            if self
                .probe_in_progress
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return None;
            }
        }
        Some(ProbeGuard {
            breaker: Arc::clone(self),
        })
    }

    /// A probe attempt failed: restart the cooldown window and record why,
    /// leaving the failure counter at threshold.
    pub fn probe_failed(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.last_failure_time = Some(Instant::now());
        state.last_error = Some(reason.to_string());
    }

    pub fn probe_in_progress(&self) -> bool {
        self.probe_in_progress.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> ApiHealth {
        let state = self.state.lock().unwrap();
        let available = state.consecutive_failures < self.fail_threshold;
        let cooldown_remaining = if available {
            0.0
        } else {
            state
                .last_failure_time
                .map(|t| {
                    let elapsed = t.elapsed();
                    if elapsed >= self.cooldown {
                        0.0
                    } else {
                        (self.cooldown - elapsed).as_secs_f64()
                    }
                })
                .unwrap_or(0.0)
        };
        ApiHealth {
            available,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            cooldown_remaining_seconds: cooldown_remaining,
            probe_in_progress: self.probe_in_progress.load(Ordering::SeqCst),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// True at most once per [`SUPPRESSION_CHIME_INTERVAL`]; the timestamp is
    /// consumed on a true return.
    pub fn should_play_suppression_chime(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let due = state
            .last_suppression_chime
            .map(|t| t.elapsed() >= SUPPRESSION_CHIME_INTERVAL)
            .unwrap_or(true);
        if due {
            state.last_suppression_chime = Some(Instant::now());
        }
        due
    }

    /// Recovery resets the chime throttle so the next outage is audible
    /// immediately.
    pub fn reset_suppression_chime_timer(&self) {
        self.state.lock().unwrap().last_suppression_chime = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_breaker(breaker: &CircuitBreaker) {
        for _ in 0..FAIL_THRESHOLD {
            breaker.record_failure(Some("exit code 1: nope"));
        }
    }

    #[test]
    fn starts_closed() {
        let b = CircuitBreaker::with_defaults();
        assert!(b.is_closed());
        let h = b.health();
        assert!(h.available);
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.last_error, None);
    }

    #[test]
    fn partial_failures_stay_closed() {
        let b = CircuitBreaker::with_defaults();
        b.record_failure(Some("timeout"));
        b.record_failure(Some("timeout"));
        assert!(b.is_closed());
    }

    #[test]
    fn threshold_opens_circuit() {
        let b = CircuitBreaker::with_defaults();
        open_breaker(&b);
        assert!(!b.is_closed());
        let h = b.health();
        assert!(!h.available);
        assert_eq!(h.consecutive_failures, 3);
        assert!(h.cooldown_remaining_seconds > 0.0);
    }

    #[test]
    fn failure_without_reason_keeps_previous_error() {
        let b = CircuitBreaker::with_defaults();
        b.record_failure(Some("timeout"));
        b.record_failure(None);
        assert_eq!(b.last_error().as_deref(), Some("timeout"));
    }

    #[test]
    fn success_clears_error_and_counters() {
        let b = CircuitBreaker::with_defaults();
        b.record_failure(Some("timeout"));
        b.record_success();
        assert_eq!(b.last_error(), None);
        assert_eq!(b.health().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_probe_during_cooldown() {
        let b = Arc::new(CircuitBreaker::with_defaults());
        open_breaker(&b);
        assert!(b.try_begin_probe().is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.try_begin_probe().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_allowed_after_cooldown_exactly_once() {
        let b = Arc::new(CircuitBreaker::with_defaults());
        open_breaker(&b);

        tokio::time::advance(Duration::from_secs(61)).await;
        let guard = b.try_begin_probe();
        assert!(guard.is_some());
        assert!(b.probe_in_progress());

        // Concurrent checks while a probe is in flight get nothing.
        assert!(b.try_begin_probe().is_none());

        drop(guard);
        assert!(!b.probe_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_restarts_cooldown() {
        let b = Arc::new(CircuitBreaker::with_defaults());
        open_breaker(&b);
        tokio::time::advance(Duration::from_secs(61)).await;

        let guard = b.try_begin_probe().unwrap();
        b.probe_failed("probe failed: exit code 1: nope");
        drop(guard);

        // Counters unchanged, circuit still open, cooldown restarted.
        let h = b.health();
        assert_eq!(h.consecutive_failures, 3);
        assert!(!h.available);
        assert!(h.cooldown_remaining_seconds > 59.0);
        assert!(b.try_begin_probe().is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(b.try_begin_probe().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_circuit() {
        let b = Arc::new(CircuitBreaker::with_defaults());
        open_breaker(&b);
        tokio::time::advance(Duration::from_secs(61)).await;

        let guard = b.try_begin_probe().unwrap();
        b.record_success();
        drop(guard);

        assert!(b.is_closed());
        let h = b.health();
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.last_error, None);
        assert_eq!(h.cooldown_remaining_seconds, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_chime_is_throttled() {
        let b = CircuitBreaker::with_defaults();
        assert!(b.should_play_suppression_chime());
        assert!(!b.should_play_suppression_chime());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(b.should_play_suppression_chime());

        b.reset_suppression_chime_timer();
        assert!(b.should_play_suppression_chime());
    }

    #[test]
    fn reset_clears_error_and_probe_flag() {
        let b = CircuitBreaker::with_defaults();
        open_breaker(&b);
        b.probe_in_progress.store(true, Ordering::SeqCst);
        b.reset();
        assert!(b.is_closed());
        assert!(!b.probe_in_progress());
        assert_eq!(b.last_error(), None);
    }
}
