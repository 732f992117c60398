use thiserror::Error;

#[derive(Debug, Error)]
pub enum EarshotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Speech error: {0}")]
    Speech(String),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EarshotError {
    /// Short error code string for wire payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EarshotError::Config(_) => "CONFIG_ERROR",
            EarshotError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            EarshotError::Speech(_) => "SPEECH_ERROR",
            EarshotError::Subprocess(_) => "SUBPROCESS_ERROR",
            EarshotError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            EarshotError::Timeout { .. } => "TIMEOUT",
            EarshotError::Serialization(_) => "SERIALIZATION_ERROR",
            EarshotError::Io(_) => "IO_ERROR",
            EarshotError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, EarshotError>;
