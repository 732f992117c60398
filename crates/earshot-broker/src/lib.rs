//! Tool dispatcher: translates decoded agent tool invocations into inbox
//! work or immediate actions, and shapes every outcome, success or failure,
//! into a stable string the agent can parse.

pub mod dispatch;
mod tools;

pub use dispatch::{ToolDispatcher, ToolInvocation};

use std::time::Duration;

use thiserror::Error;

/// How long a blocking tool waits on its completion latch.
pub const BLOCKING_TOOL_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound on the enqueue/ack round-trip of non-blocking tools.
pub const NONBLOCKING_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Suggestion line attached to every tool error.
pub const ERROR_SUGGESTION: &str =
    "Retry the tool call, or call get_logs() to inspect recent errors.";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("timed out waiting for the operator")]
    OperatorTimeout,

    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    /// Error kind name used in the stable `{error}` shape.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "UnknownTool",
            ToolError::InvalidArguments(_) => "InvalidArguments",
            ToolError::OperatorTimeout => "OperatorTimeout",
            ToolError::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;
