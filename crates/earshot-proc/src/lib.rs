pub mod supervisor;

pub use supervisor::{Supervisor, TrackedChild};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("spawn failed: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, ProcError>;
