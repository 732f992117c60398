pub mod breaker;
pub mod cache;
pub mod chime;
pub mod engine;

pub use breaker::{ApiHealth, CircuitBreaker};
pub use cache::AudioCache;
pub use engine::{SpeakOptions, TtsEngine};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("playback failed: {0}")]
    Playback(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TtsError>;
