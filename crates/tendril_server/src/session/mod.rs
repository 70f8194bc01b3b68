//! Per-window session state.
//!
//! This module contains:
//! - `Window` - The actor owning one client's reactive graph and block tree
//! - `Lifecycle` - The heartbeat state machine driving reconnects and teardown
//! - `ReplayBuffer` - Unacknowledged frames kept for resuming a connection
//! - `SessionConfig` - Heartbeat and buffer tuning

mod config;
mod lifecycle;
mod replay;
mod window;

pub use config::*;
pub use lifecycle::*;
pub use replay::*;
pub(crate) use window::{Window, WindowMessage, WindowParams};
pub use window::{CloseReason, Outbound, Transport, WindowHandle, WindowStatus};
