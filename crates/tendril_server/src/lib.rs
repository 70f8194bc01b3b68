//! Tendril Server
//!
//! Runs server-driven UI applications: each browser window gets its own
//! reactive graph on the server, and every change to its block tree is
//! streamed to the client as binary commands.
//!
//! # Architecture
//!
//! - [`WindowManager`]: creates windows, routes resumed connections, tracks
//!   the build status
//! - [`session`]: the per-window actor, heartbeat lifecycle and replay buffer
//! - [`view`]: the [`Application`] trait and the [`Ui`] handle that turns
//!   block tree edits into commands
//! - [`tasks`]: async work whose results flow back into a window's graph
//! - [`server`]: the WebSocket endpoint
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tendril_server::{run, Application, ServerConfig, ViewContext};
//!
//! struct Hello;
//!
//! impl Application for Hello {
//!     fn mount(&self, cx: &ViewContext<'_>, path: &str) -> tendril_server::Result<()> {
//!         // instantiate blocks and attach them with cx.mount_root(..)
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run(ServerConfig::default(), Arc::new(Hello)).await
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod manager;
pub mod server;
pub mod session;
pub mod tasks;
pub mod view;

pub use artifacts::{BuildArtifacts, ContentEncoding, InterningIndex};
pub use config::ServerConfig;
pub use error::{Result, SessionError};
pub use manager::{BuildStatus, ClientLink, WindowManager};
pub use server::{serve, ConnectRequest, RELOAD_CLOSE_CODE};
pub use session::{
    CloseReason, Lifecycle, LifecycleState, Outbound, ReplayBuffer, SessionConfig, WindowHandle,
    WindowStatus,
};
pub use tasks::TaskSpawner;
pub use view::{error_view, Application, EventData, Handler, SharedState, Ui, ViewContext, ERROR_TEMPLATE};

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` wins over `filter` when set. Does nothing if a subscriber is
/// already installed.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Load build artifacts, bind the listener and serve `app` until the listener fails
pub async fn run(config: ServerConfig, app: Arc<dyn Application>) -> anyhow::Result<()> {
    init_tracing(&config.log_filter);

    let shared = Arc::new(SharedState::new());
    if let Some(dir) = &config.artifacts_dir {
        let artifacts = BuildArtifacts::load(dir)?;
        let templates = artifacts.install(&shared)?;
        tracing::info!(templates, "build installed");
    }

    let manager = WindowManager::with_shared(app, config.session.clone(), shared);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    let result = serve(listener, manager.clone()).await;
    manager.shutdown();
    result
}
