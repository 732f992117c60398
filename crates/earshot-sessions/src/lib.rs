pub mod collab;
pub mod drain;
pub mod inbox;
pub mod manager;
pub mod monitor;
pub mod persist;
pub mod session;

pub use collab::{CollabError, Collaborator};
pub use inbox::{Choice, InboxItem, InboxKind};
pub use manager::SessionManager;
pub use monitor::{HealthMonitor, PidProbe, ProcessProbe};
pub use persist::PersistedSession;
pub use session::{HealthStatus, Session};

use thiserror::Error;

/// Reserved `selected` values with control-flow meaning.
pub mod sentinel {
    /// Operator pressed undo; consumed by the dispatcher (re-enqueue).
    pub const UNDO: &str = "_undo";
    /// Item was force-cancelled (dead session, collaborator failure).
    pub const CANCELLED: &str = "_cancelled";
    /// Blocking speech finished playing.
    pub const SPEECH_DONE: &str = "_speech_done";
    /// Owning caller died; a revived caller should redo the call.
    pub const RESTART: &str = "_restart";
    /// Operator skipped the item.
    pub const SKIP: &str = "_skip";
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {id}")]
    NotFound { id: String },

    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
