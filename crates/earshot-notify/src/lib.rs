//! Outbound notification fan-out: health alerts and broker events delivered
//! to ntfy/Slack/Discord/webhook sinks, off the hot path.
//!
//! Sends are fire-and-forget: every network error is logged, none is raised.

pub mod channel;
pub mod dispatch;

pub use channel::{Channel, ChannelKind};
pub use dispatch::{NotificationDispatcher, NotifyEvent};
