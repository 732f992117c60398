pub mod config;
pub mod diag;
pub mod error;
pub mod event;
pub mod uistate;

pub use error::{EarshotError, Result};

/// Epoch seconds as a float, the timestamp unit used across the broker.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
