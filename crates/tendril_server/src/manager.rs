//! Registry of live windows.
//!
//! The manager opens a window for each new client, routes resuming clients
//! back to their window, and forgets windows once their task ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::session::{Outbound, SessionConfig, Transport, Window, WindowHandle, WindowMessage, WindowParams};
use crate::view::{Application, SharedState};

/// Length of generated window ids.
pub const WINDOW_ID_LEN: usize = 21;

/// Whether the application currently has a usable build.
///
/// While broken, new mounts render the error view instead of the
/// application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BuildStatus {
    #[default]
    Ready,
    Broken {
        message: String,
    },
}

/// A client connection bound to a window.
///
/// Dropping the link tells the window its transport is gone.
#[derive(Debug)]
pub struct ClientLink {
    pub window: WindowHandle,
    pub connection: u64,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl ClientLink {
    /// Forward a binary client message to the window.
    pub fn send(&self, payload: bytes::Bytes) -> Result<()> {
        self.window.client_message(self.connection, payload)
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        self.window.disconnected(self.connection);
    }
}

struct ManagerInner {
    app: Arc<dyn Application>,
    config: SessionConfig,
    shared: Arc<SharedState>,
    build: Arc<RwLock<BuildStatus>>,
    windows: Mutex<FxHashMap<Arc<str>, WindowHandle>>,
    next_connection: AtomicU64,
}

/// Opens, resumes and tracks windows.
#[derive(Clone)]
pub struct WindowManager {
    inner: Arc<ManagerInner>,
}

impl WindowManager {
    pub fn new(app: Arc<dyn Application>, config: SessionConfig) -> Self {
        Self::with_shared(app, config, Arc::new(SharedState::new()))
    }

    /// Create a manager whose windows share pre-seeded tables and definitions.
    pub fn with_shared(app: Arc<dyn Application>, config: SessionConfig, shared: Arc<SharedState>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                app,
                config,
                shared,
                build: Arc::new(RwLock::new(BuildStatus::Ready)),
                windows: Mutex::new(FxHashMap::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.inner.shared
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Mark the build broken or fixed. Affects mounts from now on.
    pub fn set_build_status(&self, status: BuildStatus) {
        match &status {
            BuildStatus::Ready => tracing::info!("build ready"),
            BuildStatus::Broken { message } => tracing::warn!(%message, "build broken"),
        }
        *self.inner.build.write() = status;
    }

    pub fn build_status(&self) -> BuildStatus {
        self.inner.build.read().clone()
    }

    /// Create a window for a new client showing `path`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, path: &str) -> ClientLink {
        let id: Arc<str> = Arc::from(new_window_id());
        let (sender, inbox) = mpsc::unbounded_channel();
        let handle = WindowHandle::new(id.clone(), sender);

        let (window, completions) = Window::new(WindowParams {
            id: id.clone(),
            path: path.to_string(),
            app: self.inner.app.clone(),
            config: self.inner.config.clone(),
            shared: self.inner.shared.clone(),
            build: self.inner.build.clone(),
        });
        self.inner.windows.lock().insert(id.clone(), handle.clone());

        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            window.run(inbox, completions).await;
            forget(&registry, &id);
        });

        self.connect(handle, None)
    }

    /// Reattach a client to its existing window.
    ///
    /// The window itself checks `offset`; an offset it cannot replay from
    /// makes it close the new connection with a reload request.
    pub fn resume(&self, window_id: &str, path: &str, offset: u64) -> Result<ClientLink> {
        let handle = self
            .window(window_id)
            .ok_or_else(|| SessionError::UnknownWindow(window_id.to_string()))?;
        if handle.is_closed() {
            return Err(SessionError::WindowDestroyed(window_id.to_string()));
        }
        tracing::debug!(window = window_id, path, offset, "resume requested");
        Ok(self.connect(handle, Some(offset)))
    }

    fn connect(&self, handle: WindowHandle, resume: Option<u64>) -> ClientLink {
        let connection = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound) = mpsc::unbounded_channel();
        // a failed send drops the sender and the link sees a closed channel
        let _ = handle.send(WindowMessage::Connect {
            transport: Transport::new(connection, sender),
            resume,
        });
        ClientLink {
            window: handle,
            connection,
            outbound,
        }
    }

    pub fn window(&self, window_id: &str) -> Option<WindowHandle> {
        self.inner.windows.lock().get(window_id).cloned()
    }

    pub fn window_count(&self) -> usize {
        self.inner.windows.lock().len()
    }

    /// Shut down every window.
    pub fn shutdown(&self) {
        let windows: Vec<WindowHandle> = self.inner.windows.lock().values().cloned().collect();
        tracing::info!(count = windows.len(), "shutting down windows");
        for window in windows {
            window.shutdown();
        }
    }
}

impl std::fmt::Debug for WindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowManager")
            .field("windows", &self.window_count())
            .field("build", &self.build_status())
            .finish()
    }
}

fn forget(registry: &Weak<ManagerInner>, id: &Arc<str>) {
    if let Some(inner) = registry.upgrade() {
        inner.windows.lock().remove(id);
    }
}

fn new_window_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(WINDOW_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CloseReason, LifecycleState};
    use crate::view::ViewContext;
    use bytes::Bytes;
    use std::time::Duration;
    use tendril_core::{BlockDefinition, Content, TemplateNode};
    use tendril_protocol::{encode_client_message, ClientMessage, DomMirror};

    /// Counter page: a button whose click increments the label. Clicks
    /// panic on `/boom`.
    struct Counter;

    /// An application whose view can never be built.
    struct Offline;

    impl Application for Offline {
        fn mount(&self, _cx: &ViewContext<'_>, _path: &str) -> Result<()> {
            Err(SessionError::BuildUnavailable("database offline".to_string()))
        }
    }

    impl Application for Counter {
        fn mount(&self, cx: &ViewContext<'_>, path: &str) -> Result<()> {
            let ui = cx.ui();
            let definitions = &ui.shared().definitions;
            if definitions.get(1).is_none() {
                definitions.install(BlockDefinition::new(
                    1,
                    TemplateNode::element("div").children([
                        TemplateNode::element("span").child(TemplateNode::anchor()),
                        TemplateNode::element("button")
                            .target()
                            .child(TemplateNode::text("+")),
                    ]),
                )?)?;
            }

            let block = cx.instantiate(1)?;
            let graph = cx.graph();
            let count = graph.create_signal(0u32);
            let ui = cx.ui();
            let label = format!("{path}:");
            graph.create_effect(move |g| {
                let value = g.get(count).unwrap_or_default();
                let _ = ui.set_text(block, 0, format!("{label}{value}"));
            });
            let explode = path == "/boom";
            cx.on(block, 0, "click", move |g, _| {
                if explode {
                    panic!("click handler blew up");
                }
                g.update(count, |n| n + 1);
            })?;
            cx.mount_root(vec![Content::Block(block)])
        }
    }

    // heartbeats far apart so frames arrive in a predictable order
    fn manager() -> WindowManager {
        let config = SessionConfig::testing()
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_liveness_timeout(Duration::from_secs(240));
        WindowManager::new(Arc::new(Counter), config)
    }

    async fn next_frame(link: &mut ClientLink) -> Bytes {
        match tokio::time::timeout(Duration::from_secs(1), link.outbound.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    async fn click(link: &mut ClientLink, mirror: &mut DomMirror) {
        assert!(mirror.dispatch(1, 0, "click", "").unwrap());
        for message in mirror.take_outgoing() {
            link.send(message).unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_renders_initial_view() {
        let manager = manager();
        let mut link = manager.open("/home");
        let mut mirror = DomMirror::new();
        mirror.receive(&next_frame(&mut link).await).unwrap();

        assert!(mirror.window_id().is_some());
        assert_eq!(mirror.text(), "/home:0+");
        assert_eq!(manager.window_count(), 1);
    }

    #[tokio::test]
    async fn test_click_round_trip() {
        let manager = manager();
        let mut link = manager.open("/");
        let mut mirror = DomMirror::new();
        mirror.receive(&next_frame(&mut link).await).unwrap();

        click(&mut link, &mut mirror).await;
        mirror.receive(&next_frame(&mut link).await).unwrap();
        assert_eq!(mirror.text(), "/:1+");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained_to_its_window() {
        let manager = manager();
        let mut broken = manager.open("/boom");
        let mut broken_mirror = DomMirror::new();
        broken_mirror.receive(&next_frame(&mut broken).await).unwrap();
        let mut healthy = manager.open("/");
        let mut healthy_mirror = DomMirror::new();
        healthy_mirror.receive(&next_frame(&mut healthy).await).unwrap();

        click(&mut broken, &mut broken_mirror).await;
        let status = broken.window.status().await.unwrap();
        assert!(status.connected);
        assert_eq!(manager.window_count(), 2);

        click(&mut healthy, &mut healthy_mirror).await;
        healthy_mirror.receive(&next_frame(&mut healthy).await).unwrap();
        assert_eq!(healthy_mirror.text(), "/:1+");

        // the failed window keeps serving its view
        assert_eq!(broken_mirror.text(), "/boom:0+");
        assert!(!broken.window.is_closed());
    }

    #[tokio::test]
    async fn test_failed_mount_renders_error_view() {
        let manager = WindowManager::new(
            Arc::new(Offline),
            SessionConfig::testing().with_heartbeat_interval(Duration::from_secs(60)),
        );
        let mut link = manager.open("/");
        let mut mirror = DomMirror::new();
        mirror.receive(&next_frame(&mut link).await).unwrap();

        assert!(mirror.text().contains("Something went wrong"));
        assert!(mirror.text().contains("database offline"));
        assert_eq!(manager.window_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_replays_unacknowledged_frames() {
        let manager = manager();
        let mut first = manager.open("/");
        let window = first.window.id().to_string();
        let mut mirror = DomMirror::new();
        mirror.receive(&next_frame(&mut first).await).unwrap();
        let offset = mirror.read_offset();

        // a click whose update the client never sees
        click(&mut first, &mut mirror).await;
        let _lost = next_frame(&mut first).await;
        drop(first);

        let mut second = manager.resume(&window, "/", offset).unwrap();
        mirror.receive(&next_frame(&mut second).await).unwrap();
        assert_eq!(mirror.text(), "/:1+");

        let status = second.window.status().await.unwrap();
        assert!(status.connected);
        assert!(!status.pending_reopen);
    }

    #[tokio::test]
    async fn test_resume_from_bad_offset_forces_reload() {
        let manager = manager();
        let mut first = manager.open("/");
        let window = first.window.id().to_string();
        let frame = next_frame(&mut first).await;
        drop(first);

        // the middle of the only frame
        let mut second = manager.resume(&window, "/", frame.len() as u64 / 2).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), second.outbound.recv()).await;
        assert_eq!(closed.unwrap(), Some(Outbound::Close(CloseReason::Reload)));
    }

    #[tokio::test]
    async fn test_resume_unknown_window() {
        let manager = manager();
        let err = manager.resume("missing", "/", 0).unwrap_err();
        assert_eq!(err, SessionError::UnknownWindow("missing".to_string()));
    }

    #[tokio::test]
    async fn test_pong_ahead_of_writes_forces_reload() {
        let manager = manager();
        let mut link = manager.open("/");
        let _init = next_frame(&mut link).await;

        let pong = encode_client_message(&ClientMessage::Pong {
            read_offset: u64::MAX,
        })
        .unwrap();
        link.send(pong).unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(1), link.outbound.recv()).await {
                Ok(Some(Outbound::Frame(_))) => continue,
                other => {
                    assert_eq!(other.unwrap(), Some(Outbound::Close(CloseReason::Reload)));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_garbage_message_drops_transport() {
        let manager = manager();
        let mut link = manager.open("/");
        let _init = next_frame(&mut link).await;

        link.send(Bytes::from_static(&[0xEE, 1, 2])).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), link.outbound.recv()).await;
        assert_eq!(closed.unwrap(), Some(Outbound::Close(CloseReason::Desync)));

        let status = link.window.status().await.unwrap();
        assert!(status.pending_reopen);
        assert_eq!(status.state, LifecycleState::Reconnecting);
    }

    #[tokio::test]
    async fn test_broken_build_renders_error_view() {
        let manager = manager();
        manager.set_build_status(BuildStatus::Broken {
            message: "syntax error in main".to_string(),
        });
        let mut link = manager.open("/");
        let mut mirror = DomMirror::new();
        mirror.receive(&next_frame(&mut link).await).unwrap();

        assert!(mirror.text().contains("Something went wrong"));
        assert!(mirror.text().contains("syntax error in main"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_destroys_window() {
        let manager = WindowManager::new(Arc::new(Counter), SessionConfig::testing());
        let link = manager.open("/");
        let handle = link.window.clone();

        // testing config: destroyed after 5 missed heartbeats of 10ms
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.is_closed());
        assert_eq!(manager.window_count(), 0);
        drop(link);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let manager = manager();
        let mut link = manager.open("/");
        let _init = next_frame(&mut link).await;

        manager.shutdown();
        let closed = tokio::time::timeout(Duration::from_secs(1), link.outbound.recv()).await;
        assert_eq!(closed.unwrap(), Some(Outbound::Close(CloseReason::Reload)));
    }
}
