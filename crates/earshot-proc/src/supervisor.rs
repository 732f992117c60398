//! Child-process supervisor: every subprocess the broker spawns (playback,
//! synthesis, shell commands) is tracked here so it can be cancelled as a
//! group from any task.
//!
//! Children are spawned as their own session leaders so the whole process
//! group dies on cancel; killing an already-dead group is a no-op.

use std::sync::{Arc, Mutex};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::{ProcError, Result};

/// A tracked subprocess handle. Clones share the underlying child.
#[derive(Clone, Debug)]
pub struct TrackedChild {
    pid: u32,
    tag: String,
    use_pgid: bool,
    child: Arc<tokio::sync::Mutex<Child>>,
}

impl TrackedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether the child is still running. When another task currently holds
    /// the handle (awaiting exit), the child is by definition still running.
    pub fn alive(&self) -> bool {
        match self.child.try_lock() {
            Ok(mut guard) => matches!(guard.try_wait(), Ok(None)),
            Err(_) => true,
        }
    }

    /// Kill the child (and its process group when it leads one). Errors are
    /// swallowed: a missing process group means the child already exited.
    pub fn kill(&self) {
        if !self.alive() {
            return;
        }
        if self.use_pgid {
            let rc = unsafe { libc::killpg(self.pid as libc::pid_t, libc::SIGKILL) };
            if rc == 0 {
                return;
            }
        }
        if let Ok(mut guard) = self.child.try_lock() {
            let _ = guard.start_kill();
        }
    }

    /// Await the child's exit status.
    pub async fn wait(&self) -> Option<std::process::ExitStatus> {
        self.child.lock().await.wait().await.ok()
    }

    /// Take the child's piped stdout, if any. Used by callers that stream
    /// subprocess output (e.g. synthesis to a temp file).
    pub async fn take_stdout(&self) -> Option<tokio::process::ChildStdout> {
        self.child.lock().await.stdout.take()
    }

    /// Take the child's piped stderr, if any.
    pub async fn take_stderr(&self) -> Option<tokio::process::ChildStderr> {
        self.child.lock().await.stderr.take()
    }
}

/// Tracks all live children behind one mutex. The lock guards only the list;
/// spawning, killing, and waiting all happen outside it.
pub struct Supervisor {
    active: Mutex<Vec<TrackedChild>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `cmd` as its own session leader and track it under `tag`.
    ///
    /// Dead entries are pruned opportunistically here so the list stays
    /// bounded without a reaper task.
    pub fn start(&self, mut cmd: Command, tag: &str) -> Result<TrackedChild> {
        self.prune_dead();

        // setsid puts the child in a fresh process group; kill() can then
        // take out the whole pipeline it spawns.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| ProcError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| ProcError::Spawn("child exited before tracking".to_string()))?;

        let tracked = TrackedChild {
            pid,
            tag: tag.to_string(),
            use_pgid: true,
            child: Arc::new(tokio::sync::Mutex::new(child)),
        };

        debug!(pid, tag, "tracked subprocess started");
        self.active.lock().unwrap().push(tracked.clone());
        Ok(tracked)
    }

    /// Kill every tracked child. The list is swapped out atomically under the
    /// mutex; the kills happen after it is released.
    pub fn cancel_all(&self) {
        let to_kill = std::mem::take(&mut *self.active.lock().unwrap());
        for tracked in to_kill {
            tracked.kill();
        }
    }

    /// Kill only children carrying `tag`; others are preserved.
    pub fn cancel_tagged(&self, tag: &str) {
        let to_kill: Vec<TrackedChild> = {
            let mut active = self.active.lock().unwrap();
            let (kill, keep): (Vec<_>, Vec<_>) = active.drain(..).partition(|t| t.tag == tag);
            *active = keep;
            kill
        };
        for tracked in to_kill {
            tracked.kill();
        }
    }

    /// Most recent live child with `tag`, if any.
    pub fn get_by_tag(&self, tag: &str) -> Option<TrackedChild> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.tag == tag && t.alive())
            .cloned()
    }

    /// Whether any (optionally tagged) child is still alive.
    pub fn has_active(&self, tag: Option<&str>) -> bool {
        self.active
            .lock()
            .unwrap()
            .iter()
            .any(|t| tag.is_none_or(|wanted| t.tag == wanted) && t.alive())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().iter().filter(|t| t.alive()).count()
    }

    fn prune_dead(&self) {
        self.active.lock().unwrap().retain(|t| t.alive());
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
