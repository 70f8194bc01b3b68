//! One connected client: reactive graph, block tree and transport.
//!
//! A window runs as its own tokio task and is the only place its
//! [`ReactiveGraph`] is touched. Everything else talks to it through a
//! [`WindowHandle`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tendril_core::{ReactiveGraph, ReactiveStats, Root, Scope, ROOT_BLOCK};
use tendril_protocol::{decode_client_message, encode_command, ClientMessage, ServerCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::config::SessionConfig;
use super::lifecycle::{Lifecycle, LifecycleState, TickAction};
use super::replay::{Ack, ReplayBuffer};
use crate::error::{Result, SessionError};
use crate::manager::BuildStatus;
use crate::tasks::{Completion, TaskSpawner};
use crate::view::{error_view, Application, EventData, SharedState, Ui, ViewContext};

/// Why the server is closing a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client must reload the page (close code 3001).
    Reload,
    /// A client message could not be decoded; the client should resume.
    Desync,
    /// Heartbeats stopped arriving; the client should resume.
    Dropped,
}

/// Something for a connection to send to its client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(Bytes),
    Close(CloseReason),
}

/// The window's end of one client connection.
#[derive(Debug)]
pub struct Transport {
    connection: u64,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl Transport {
    pub fn new(connection: u64, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { connection, sender }
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    fn send(&self, outbound: Outbound) -> bool {
        self.sender.send(outbound).is_ok()
    }
}

#[derive(Debug)]
pub(crate) enum WindowMessage {
    /// A client connected; `resume` carries its read offset when resuming.
    Connect {
        transport: Transport,
        resume: Option<u64>,
    },
    Client {
        connection: u64,
        payload: Bytes,
    },
    Disconnected {
        connection: u64,
    },
    Inspect(oneshot::Sender<WindowStatus>),
    Shutdown,
}

/// Snapshot of a window's state.
#[derive(Clone, Debug)]
pub struct WindowStatus {
    pub window_id: String,
    pub state: LifecycleState,
    pub path: String,
    pub connected: bool,
    pub pending_reopen: bool,
    pub write_offset: u64,
    pub acked_offset: u64,
    pub blocks: usize,
    pub handlers: usize,
    pub reactive: ReactiveStats,
}

/// Cloneable address of a running window.
#[derive(Clone, Debug)]
pub struct WindowHandle {
    id: Arc<str>,
    sender: mpsc::UnboundedSender<WindowMessage>,
}

impl WindowHandle {
    pub(crate) fn new(id: Arc<str>, sender: mpsc::UnboundedSender<WindowMessage>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the window task has ended.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn send(&self, message: WindowMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| SessionError::WindowDestroyed(self.id.to_string()))
    }

    /// Forward a binary message received on `connection`.
    pub fn client_message(&self, connection: u64, payload: Bytes) -> Result<()> {
        self.send(WindowMessage::Client {
            connection,
            payload,
        })
    }

    /// Report that `connection` closed.
    pub fn disconnected(&self, connection: u64) {
        let _ = self.send(WindowMessage::Disconnected { connection });
    }

    pub async fn status(&self) -> Result<WindowStatus> {
        let (reply, response) = oneshot::channel();
        self.send(WindowMessage::Inspect(reply))?;
        response
            .await
            .map_err(|_| SessionError::WindowDestroyed(self.id.to_string()))
    }

    /// Destroy the window, disposing its reactive root.
    pub fn shutdown(&self) {
        let _ = self.send(WindowMessage::Shutdown);
    }
}

pub(crate) struct WindowParams {
    pub id: Arc<str>,
    pub path: String,
    pub app: Arc<dyn Application>,
    pub config: SessionConfig,
    pub shared: Arc<SharedState>,
    pub build: Arc<RwLock<BuildStatus>>,
}

/// Server-side state of one client.
pub struct Window {
    id: Arc<str>,
    path: String,
    app: Arc<dyn Application>,
    config: SessionConfig,
    build: Arc<RwLock<BuildStatus>>,
    graph: ReactiveGraph,
    root: Root,
    view: Option<Scope>,
    ui: Ui,
    spawner: TaskSpawner,
    replay: ReplayBuffer,
    lifecycle: Lifecycle,
    transport: Option<Transport>,
    pending_reopen: bool,
}

impl Window {
    pub(crate) fn new(params: WindowParams) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (spawner, completions) = TaskSpawner::new(params.id.clone());
        let graph = ReactiveGraph::new();
        let (root, ()) = graph.create_root(|g| {
            g.provide_context(TaskSpawner::context(), Some(spawner.clone()));
        });
        let ui = Ui::new(params.id.clone(), params.shared);

        let window = Self {
            replay: ReplayBuffer::new(params.config.replay_buffer_bytes),
            lifecycle: Lifecycle::new(&params.config, Instant::now()),
            id: params.id,
            path: params.path,
            app: params.app,
            config: params.config,
            build: params.build,
            graph,
            root,
            view: None,
            ui,
            spawner,
            transport: None,
            pending_reopen: false,
        };
        (window, completions)
    }

    /// Drive the window until it is destroyed or shut down.
    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<WindowMessage>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(WindowMessage::Shutdown) | None => break,
                    Some(message) => self.handle(message),
                },
                Some(completion) = completions.recv() => self.complete(completion),
                _ = ticker.tick() => {
                    if self.tick() {
                        break;
                    }
                }
            }
        }
        self.teardown();
    }

    fn handle(&mut self, message: WindowMessage) {
        match message {
            WindowMessage::Connect {
                transport,
                resume: None,
            } => self.start(transport),
            WindowMessage::Connect {
                transport,
                resume: Some(offset),
            } => self.resume(transport, offset),
            WindowMessage::Client {
                connection,
                payload,
            } => {
                if self.is_current(connection) {
                    self.client_message(&payload);
                } else {
                    tracing::trace!(window = %self.id, connection, "message from stale connection");
                }
            }
            WindowMessage::Disconnected { connection } => {
                if self.is_current(connection) {
                    tracing::info!(window = %self.id, "transport closed, awaiting resume");
                    self.transport = None;
                    self.pending_reopen = true;
                    self.lifecycle.on_transport_lost();
                }
            }
            WindowMessage::Inspect(reply) => {
                let _ = reply.send(self.status());
            }
            WindowMessage::Shutdown => {}
        }
    }

    fn is_current(&self, connection: u64) -> bool {
        self.transport
            .as_ref()
            .map(|transport| transport.connection == connection)
            .unwrap_or(false)
    }

    fn start(&mut self, transport: Transport) {
        tracing::info!(window = %self.id, path = %self.path, "window opened");
        self.transport = Some(transport);
        self.mount(false);
        self.lifecycle.on_init_sent(Instant::now());
    }

    fn resume(&mut self, transport: Transport, offset: u64) {
        let Some(frames) = self.replay.replay_from(offset) else {
            tracing::info!(
                window = %self.id,
                offset,
                write_offset = self.replay.write_offset(),
                "resume offset cannot be served, forcing reload"
            );
            transport.send(Outbound::Close(CloseReason::Reload));
            return;
        };

        tracing::info!(window = %self.id, offset, frames = frames.len(), "window resumed");
        self.replay.acknowledge(offset);
        // replacing the transport drops the old sender, closing that connection
        self.transport = Some(transport);
        self.pending_reopen = false;
        self.lifecycle.on_resumed(Instant::now());
        for frame in frames {
            self.transmit(frame);
        }
    }

    fn client_message(&mut self, payload: &[u8]) {
        if payload.len() > self.config.max_client_message_bytes {
            tracing::warn!(window = %self.id, len = payload.len(), "client message too large");
            self.drop_transport(CloseReason::Desync);
            return;
        }
        let message = match decode_client_message(payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(window = %self.id, error = %err, "client message desync");
                self.drop_transport(CloseReason::Desync);
                return;
            }
        };

        self.lifecycle.on_client_message(Instant::now());
        match message {
            ClientMessage::Pong { read_offset } => {
                if self.replay.acknowledge(read_offset) == Ack::Ahead {
                    tracing::warn!(
                        window = %self.id,
                        read_offset,
                        write_offset = self.replay.write_offset(),
                        "client acknowledged unsent bytes, forcing reload"
                    );
                    self.drop_transport(CloseReason::Reload);
                }
            }
            ClientMessage::Event { handler, data } => self.dispatch(handler, data),
            ClientMessage::BackNav { path } => {
                tracing::debug!(window = %self.id, path = %path, "back navigation");
                self.path = path;
                self.mount(true);
            }
        }
    }

    fn dispatch(&mut self, handler_id: u16, data: String) {
        let Some(handler) = self.ui.handler(handler_id) else {
            tracing::debug!(window = %self.id, handler = handler_id, "event for unbound handler");
            return;
        };
        let event = EventData::new(handler_id, data);
        let owner = self.view.map(|scope| scope.id()).unwrap_or(self.root.id());
        self.run_contained("event handler", |graph| {
            graph.with_owner(owner, |g| handler(g, &event));
        });
        self.flush();
    }

    fn complete(&mut self, completion: Completion) {
        let applied = self.run_contained("task completion", |graph| completion.apply(graph));
        if applied == Some(false) {
            tracing::trace!(window = %self.id, "completion for disposed owner skipped");
        }
        self.flush();
    }

    /// Returns true when the window must be destroyed.
    fn tick(&mut self) -> bool {
        match self.lifecycle.on_tick(Instant::now()) {
            TickAction::Idle => false,
            TickAction::SendPing => {
                if self.transport.is_some() {
                    self.send_commands(&[ServerCommand::Ping]);
                }
                false
            }
            TickAction::DropTransport => {
                tracing::info!(
                    window = %self.id,
                    missed = self.lifecycle.missed(),
                    "heartbeat lost, dropping transport"
                );
                self.drop_transport(CloseReason::Dropped);
                false
            }
            TickAction::Destroy => {
                tracing::info!(window = %self.id, "no viable reconnection, destroying window");
                true
            }
        }
    }

    fn drop_transport(&mut self, reason: CloseReason) {
        if let Some(transport) = self.transport.take() {
            transport.send(Outbound::Close(reason));
        }
        self.pending_reopen = true;
        self.lifecycle.on_transport_lost();
    }

    /// Replace the current view with a fresh mount of `self.path`.
    fn mount(&mut self, navigation: bool) {
        if let Some(view) = self.view.take() {
            self.graph.dispose_scope(view);
        }
        if navigation {
            if let Err(err) = self.ui.attach(ROOT_BLOCK, 0, Vec::new()) {
                tracing::error!(window = %self.id, error = %err, "failed to clear view");
            }
        }

        let build = self.build.read().clone();
        let app = self.app.clone();
        let ui = self.ui.clone();
        let spawner = self.spawner.clone();
        let root = self.root.id();
        let path = self.path.clone();
        let mounted = self.run_contained("mount", |graph| {
            graph.with_owner(root, |g| {
                g.create_scope(|g| {
                    let cx = ViewContext::new(g, ui, spawner, &path);
                    match &build {
                        BuildStatus::Ready if navigation => app.navigate(&cx, &path),
                        BuildStatus::Ready => app.mount(&cx, &path),
                        BuildStatus::Broken { message } => error_view(&cx, message),
                    }
                })
            })
        });

        match mounted.flatten() {
            Some((scope, Ok(()))) => self.view = Some(scope),
            Some((scope, Err(err))) => {
                tracing::error!(window = %self.id, path = %self.path, error = %err, "mount failed");
                self.graph.dispose_scope(scope);
                self.show_error(&err.to_string());
            }
            None => self.show_error("the application failed while rendering this page"),
        }
        self.flush();
    }

    fn show_error(&mut self, message: &str) {
        if let Err(err) = self.ui.attach(ROOT_BLOCK, 0, Vec::new()) {
            tracing::error!(window = %self.id, error = %err, "failed to clear view");
        }
        let ui = self.ui.clone();
        let spawner = self.spawner.clone();
        let root = self.root.id();
        let path = self.path.clone();
        let shown = self.run_contained("error view", |graph| {
            graph.with_owner(root, |g| {
                g.create_scope(|g| error_view(&ViewContext::new(g, ui, spawner, &path), message))
            })
        });
        match shown.flatten() {
            Some((scope, Ok(()))) => self.view = Some(scope),
            Some((_, Err(err))) => {
                tracing::error!(window = %self.id, error = %err, "error view failed");
            }
            None => {}
        }
    }

    /// Run reactive work, containing panics and uncaught errors to this window.
    fn run_contained<R>(&self, what: &str, f: impl FnOnce(&ReactiveGraph) -> R) -> Option<R> {
        let graph = &self.graph;
        match panic::catch_unwind(AssertUnwindSafe(|| graph.try_batch(f))) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::error!(window = %self.id, error = %err, "{what} failed");
                None
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(window = %self.id, panic = %message, "{what} panicked");
                None
            }
        }
    }

    /// Release detached blocks and ship everything queued as one frame.
    fn flush(&mut self) {
        loop {
            let scopes = self.ui.collect_released();
            if scopes.is_empty() {
                break;
            }
            for scope in scopes {
                self.graph.dispose_scope(scope);
            }
        }
        if let Some(err) = self.graph.take_error() {
            tracing::error!(window = %self.id, error = %err, "cleanup failed");
        }

        if let Some(path) = self.ui.take_navigation() {
            tracing::debug!(window = %self.id, path = %path, "server navigation");
            self.path = path;
            self.mount(true);
            return;
        }

        let commands = self.ui.take_commands();
        self.send_commands(&commands);
    }

    fn send_commands(&mut self, commands: &[ServerCommand]) {
        if commands.is_empty() {
            return;
        }
        let mut buf = BytesMut::new();
        for command in commands {
            if let Err(err) = encode_command(&mut buf, command) {
                tracing::error!(
                    window = %self.id,
                    opcode = ?command.opcode(),
                    error = %err,
                    "command dropped"
                );
            }
        }
        if buf.is_empty() {
            return;
        }

        let frame = buf.freeze();
        let offset = self.replay.push(frame.clone());
        tracing::trace!(window = %self.id, offset, len = frame.len(), "frame queued");
        self.transmit(frame);
    }

    fn transmit(&mut self, frame: Bytes) {
        let Some(transport) = &self.transport else {
            return;
        };
        if !transport.send(Outbound::Frame(frame)) {
            tracing::debug!(window = %self.id, "transport gone while sending");
            self.transport = None;
            self.pending_reopen = true;
            self.lifecycle.on_transport_lost();
        }
    }

    fn status(&self) -> WindowStatus {
        WindowStatus {
            window_id: self.id.to_string(),
            state: self.lifecycle.state(),
            path: self.path.clone(),
            connected: self.transport.is_some(),
            pending_reopen: self.pending_reopen,
            write_offset: self.replay.write_offset(),
            acked_offset: self.replay.acked(),
            blocks: self.ui.block_count(),
            handlers: self.ui.handler_count(),
            reactive: self.graph.stats(),
        }
    }

    fn teardown(&mut self) {
        self.lifecycle.destroy();
        if let Some(transport) = self.transport.take() {
            transport.send(Outbound::Close(CloseReason::Reload));
        }
        self.view = None;
        self.graph.dispose_root(self.root);
        if let Some(err) = self.graph.take_error() {
            tracing::error!(window = %self.id, error = %err, "cleanup failed during teardown");
        }
        tracing::info!(window = %self.id, "window destroyed");
    }
}
