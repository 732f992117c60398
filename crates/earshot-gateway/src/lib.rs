//! Operator-facing HTTP surface and the broker's process wiring.

pub mod app;
pub mod bridge;
pub mod collab;
pub mod forward;
pub mod http;

pub use app::{build_router, AppState};
