//! Block tree to command translation
//!
//! [`Ui`] is a window's handle on its block registry. Every mutation is
//! validated against the registry and recorded as a pending wire command;
//! the window drains the commands into one frame after each batch.
//! [`ViewContext`] is what an [`Application`] sees while it mounts.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tendril_core::{
    BlockError, BlockId, BlockRegistry, Content, DefinitionCache, InternSnapshot, InternTables,
    ReactiveGraph, Scope, TableKind, TemplateId, TemplateNode, ROOT_BLOCK,
};
use tendril_protocol::{
    ClientFunction, ElementUpdate, InternDump, Key, ServerCommand, TemplateBuffer,
};

use crate::error::{Result, SessionError};
use crate::tasks::TaskSpawner;

/// Interning tables and block definitions shared by every window
#[derive(Debug, Default)]
pub struct SharedState {
    pub tables: InternTables,
    pub definitions: DefinitionCache,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Payload of a client event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    handler: u16,
    data: String,
}

impl EventData {
    pub fn new(handler: u16, data: impl Into<String>) -> Self {
        Self {
            handler,
            data: data.into(),
        }
    }

    pub fn handler(&self) -> u16 {
        self.handler
    }

    /// Raw payload as sent by the client
    pub fn text(&self) -> &str {
        &self.data
    }

    /// Payload parsed as JSON
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }
}

/// Event handler bound with [`Ui::on`]
pub type Handler = Arc<dyn Fn(&ReactiveGraph, &EventData) + Send + Sync>;

/// A server-driven application
pub trait Application: Send + Sync + 'static {
    /// Build the view for `path` into a fresh window
    fn mount(&self, cx: &ViewContext<'_>, path: &str) -> Result<()>;

    /// Rebuild the view after the window moved to `path`
    fn navigate(&self, cx: &ViewContext<'_>, path: &str) -> Result<()> {
        self.mount(cx, path)
    }
}

struct UiState {
    window: Arc<str>,
    registry: BlockRegistry,
    snapshot: InternSnapshot,
    /// Templates this window's client already has
    installed: BTreeSet<TemplateId>,
    handlers: FxHashMap<u16, Handler>,
    bindings: FxHashMap<(BlockId, u8, u8), u16>,
    /// Ids are handed out round-robin so a freed id stays unused for as
    /// long as possible; events still in flight for it then find nothing.
    next_handler: u16,
    scopes: FxHashMap<BlockId, Scope>,
    next_function: u32,
    pending: Vec<ServerCommand>,
    navigation: Option<String>,
}

impl UiState {
    fn key(&self, shared: &SharedState, kind: TableKind, name: &str) -> Key {
        // later windows get the name in their INIT_WINDOW dump
        shared.tables.table(kind).intern(name);
        Key::resolve(self.snapshot.code(&shared.tables, kind, name), name)
    }

    fn allocate_handler(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_handler;
            self.next_handler = self.next_handler.wrapping_add(1);
            if !self.handlers.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(SessionError::HandlersExhausted)
    }

    fn unbind(&mut self, handler: u16) {
        self.handlers.remove(&handler);
    }
}

/// Handle to one window's block tree
///
/// Cheap to clone and safe to capture in effects and event handlers.
#[derive(Clone)]
pub struct Ui {
    state: Arc<Mutex<UiState>>,
    shared: Arc<SharedState>,
}

impl Ui {
    /// Create the block tree of a new window
    ///
    /// The INIT_WINDOW command is queued first, dumping the interning tables
    /// as they are right now.
    pub(crate) fn new(window: Arc<str>, shared: Arc<SharedState>) -> Self {
        let snapshot = shared.tables.snapshot();
        let dump = |kind| {
            snapshot
                .entries(&shared.tables, kind)
                .iter()
                .map(|name| name.to_string())
                .collect::<Vec<_>>()
        };
        let init = ServerCommand::InitWindow {
            window_id: window.to_string(),
            tables: InternDump {
                tags: dump(TableKind::Tags),
                attributes: dump(TableKind::Attributes),
                styles: dump(TableKind::Styles),
                events: dump(TableKind::Events),
            },
        };

        Self {
            state: Arc::new(Mutex::new(UiState {
                window,
                registry: BlockRegistry::new(),
                snapshot,
                installed: BTreeSet::new(),
                handlers: FxHashMap::default(),
                bindings: FxHashMap::default(),
                next_handler: 0,
                scopes: FxHashMap::default(),
                next_function: 0,
                pending: vec![init],
                navigation: None,
            })),
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Create a detached block from an installed definition
    ///
    /// The block is released at the end of the current batch unless it is
    /// attached to an anchor first.
    pub fn instantiate(&self, template: TemplateId) -> Result<BlockId> {
        let definition = self
            .shared
            .definitions
            .get(template)
            .ok_or(BlockError::UnknownTemplate(template))?;

        let mut state = self.state.lock();
        if !state.installed.contains(&template) {
            let buffer = TemplateBuffer::from_definition(&definition, |tag| {
                state.key(&self.shared, TableKind::Tags, tag)
            });
            state.pending.push(ServerCommand::InstallTemplate {
                id: template,
                template: buffer,
            });
            state.installed.insert(template);
        }

        let block = state.registry.instantiate(&definition)?;
        state
            .pending
            .push(ServerCommand::InitBlock { block, template });
        Ok(block)
    }

    /// Instantiate a block whose reactive work lives as long as the block
    ///
    /// `build` runs in a child scope of the current owner; the scope is
    /// disposed when the block is released.
    pub fn instantiate_scoped<R>(
        &self,
        graph: &ReactiveGraph,
        template: TemplateId,
        build: impl FnOnce(&ReactiveGraph, BlockId) -> R,
    ) -> Result<(BlockId, R)> {
        let block = self.instantiate(template)?;
        let (scope, result) = graph.create_scope(|g| build(g, block));
        self.state.lock().scopes.insert(block, scope);
        Ok((block, result))
    }

    /// Replace the content of one anchor
    pub fn attach(&self, block: BlockId, anchor: u8, content: Vec<Content>) -> Result<()> {
        let mut state = self.state.lock();
        state.registry.attach(block, anchor, content.clone())?;
        state.pending.push(ServerCommand::AttachAnchor {
            block,
            anchor,
            content,
        });
        Ok(())
    }

    /// Replace an anchor's content with a single text node
    pub fn set_text(&self, block: BlockId, anchor: u8, text: impl Into<String>) -> Result<()> {
        self.attach(block, anchor, vec![Content::Text(text.into())])
    }

    fn update(&self, block: BlockId, target: u8, update: impl FnOnce(&UiState) -> ElementUpdate) -> Result<()> {
        let mut state = self.state.lock();
        state.registry.check_target(block, target)?;
        let update = update(&*state);
        state.pending.push(ServerCommand::ElementUpdate {
            block,
            target,
            update,
        });
        Ok(())
    }

    /// Set a style property; an empty value removes it
    pub fn set_style(&self, block: BlockId, target: u8, name: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        self.update(block, target, |state| ElementUpdate::Style {
            key: state.key(&self.shared, TableKind::Styles, name),
            value,
        })
    }

    pub fn set_attribute(&self, block: BlockId, target: u8, name: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        self.update(block, target, |state| ElementUpdate::SetAttribute {
            key: state.key(&self.shared, TableKind::Attributes, name),
            value,
        })
    }

    pub fn remove_attribute(&self, block: BlockId, target: u8, name: &str) -> Result<()> {
        self.update(block, target, |state| ElementUpdate::RemoveAttribute {
            key: state.key(&self.shared, TableKind::Attributes, name),
        })
    }

    pub fn toggle_class(&self, block: BlockId, target: u8, name: &str, on: bool) -> Result<()> {
        self.update(block, target, |_| ElementUpdate::ToggleClass {
            name: name.to_string(),
            on,
        })
    }

    pub fn set_checked(&self, block: BlockId, target: u8, checked: bool) -> Result<()> {
        self.update(block, target, |_| ElementUpdate::Checked(checked))
    }

    /// Bind `handler` to a DOM event on a target
    ///
    /// Binding the same event on the same target again replaces the handler.
    /// The event must be known to this window's client.
    pub fn on<F>(&self, block: BlockId, target: u8, event: &str, handler: F) -> Result<u16>
    where
        F: Fn(&ReactiveGraph, &EventData) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.registry.check_target(block, target)?;
        let code = state
            .snapshot
            .code(&self.shared.tables, TableKind::Events, event)
            .and_then(|code| u8::try_from(code).ok())
            .ok_or_else(|| SessionError::UnknownEvent(event.to_string()))?;

        if let Some(previous) = state.bindings.remove(&(block, target, code)) {
            state.unbind(previous);
        }
        let id = state.allocate_handler()?;
        state.handlers.insert(id, Arc::new(handler));
        state.bindings.insert((block, target, code), id);
        state.pending.push(ServerCommand::AttachEvent {
            block,
            target,
            event: code,
            handler: id,
        });
        Ok(id)
    }

    /// Push a new history entry on the client and re-mount for `path`
    pub fn navigate(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = self.state.lock();
        state.pending.push(ServerCommand::Nav { path: path.clone() });
        state.navigation = Some(path);
    }

    /// Set a cookie on the client
    pub fn set_client_data(&self, cookie: impl Into<String>, expiration: u32) {
        self.state.lock().pending.push(ServerCommand::ClientDataSet {
            cookie: cookie.into(),
            expiration,
        });
    }

    /// Install a function on the client; returns its id
    pub fn install_function(&self, arg_names: &[&str], body: impl Into<String>) -> Result<u16> {
        let mut state = self.state.lock();
        let id = u16::try_from(state.next_function).map_err(|_| SessionError::HandlersExhausted)?;
        state.next_function += 1;
        state.pending.push(ServerCommand::InstallClientFunction {
            id,
            function: ClientFunction {
                arg_names: arg_names.iter().map(|name| name.to_string()).collect(),
                body: body.into(),
            },
        });
        Ok(id)
    }

    /// Call a function installed with [`install_function`](Self::install_function)
    pub fn run_function(&self, id: u16, args: Vec<serde_json::Value>) {
        self.state
            .lock()
            .pending
            .push(ServerCommand::RunClientFunction { id, args });
    }

    // =========================================================================
    // Window side
    // =========================================================================

    pub(crate) fn handler(&self, id: u16) -> Option<Handler> {
        self.state.lock().handlers.get(&id).cloned()
    }

    /// Release detached blocks, queueing REMOVE_BLOCKS
    ///
    /// Returns the reactive scopes of released blocks; the caller disposes
    /// them once the lock is no longer held.
    pub(crate) fn collect_released(&self) -> Vec<Scope> {
        let mut state = self.state.lock();
        let released = state.registry.collect_released();
        if released.is_empty() {
            return Vec::new();
        }

        let stale: Vec<u16> = state
            .bindings
            .iter()
            .filter(|((block, _, _), _)| released.contains(block))
            .map(|(_, handler)| *handler)
            .collect();
        state
            .bindings
            .retain(|(block, _, _), _| !released.contains(block));
        for handler in stale {
            state.unbind(handler);
        }

        let scopes = released
            .iter()
            .filter_map(|block| state.scopes.remove(block))
            .collect();
        tracing::trace!(window = %state.window, count = released.len(), "blocks removed");
        state
            .pending
            .push(ServerCommand::RemoveBlocks { blocks: released });
        scopes
    }

    pub(crate) fn take_commands(&self) -> Vec<ServerCommand> {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub(crate) fn take_navigation(&self) -> Option<String> {
        self.state.lock().navigation.take()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }
}

impl std::fmt::Debug for Ui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Ui")
            .field("window", &state.window)
            .field("blocks", &state.registry.len())
            .field("handlers", &state.handlers.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// What an application sees while mounting a view
pub struct ViewContext<'a> {
    graph: &'a ReactiveGraph,
    ui: Ui,
    spawner: TaskSpawner,
    path: &'a str,
}

impl<'a> ViewContext<'a> {
    pub(crate) fn new(graph: &'a ReactiveGraph, ui: Ui, spawner: TaskSpawner, path: &'a str) -> Self {
        Self {
            graph,
            ui,
            spawner,
            path,
        }
    }

    pub fn graph(&self) -> &'a ReactiveGraph {
        self.graph
    }

    /// A handle to capture in effects and handlers
    pub fn ui(&self) -> Ui {
        self.ui.clone()
    }

    pub fn spawner(&self) -> &TaskSpawner {
        &self.spawner
    }

    pub fn path(&self) -> &str {
        self.path
    }

    pub fn instantiate(&self, template: TemplateId) -> Result<BlockId> {
        self.ui.instantiate(template)
    }

    pub fn instantiate_scoped<R>(
        &self,
        template: TemplateId,
        build: impl FnOnce(&ReactiveGraph, BlockId) -> R,
    ) -> Result<(BlockId, R)> {
        self.ui.instantiate_scoped(self.graph, template, build)
    }

    pub fn attach(&self, block: BlockId, anchor: u8, content: Vec<Content>) -> Result<()> {
        self.ui.attach(block, anchor, content)
    }

    /// Put content at the window's mount point
    pub fn mount_root(&self, content: Vec<Content>) -> Result<()> {
        self.ui.attach(ROOT_BLOCK, 0, content)
    }

    pub fn on<F>(&self, block: BlockId, target: u8, event: &str, handler: F) -> Result<u16>
    where
        F: Fn(&ReactiveGraph, &EventData) + Send + Sync + 'static,
    {
        self.ui.on(block, target, event, handler)
    }
}

/// Template id reserved for the built-in error view
pub const ERROR_TEMPLATE: TemplateId = 0xFFFE;

/// Render `message` as the whole window content
pub fn error_view(cx: &ViewContext<'_>, message: &str) -> Result<()> {
    let definitions = &cx.ui.shared().definitions;
    if definitions.get(ERROR_TEMPLATE).is_none() {
        definitions.install(tendril_core::BlockDefinition::new(
            ERROR_TEMPLATE,
            TemplateNode::element("div")
                .attr("class", "tendril-error")
                .child(TemplateNode::element("h1").child(TemplateNode::text("Something went wrong")))
                .child(TemplateNode::element("pre").child(TemplateNode::anchor())),
        )?)?;
    }

    let block = cx.instantiate(ERROR_TEMPLATE)?;
    cx.ui.set_text(block, 0, message)?;
    cx.mount_root(vec![Content::Block(block)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendril_core::{BlockDefinition, ROOT_TARGET};

    fn ui() -> Ui {
        let shared = Arc::new(SharedState::new());
        shared
            .definitions
            .install(
                BlockDefinition::new(
                    1,
                    TemplateNode::element("button")
                        .child(TemplateNode::element("span").target().child(TemplateNode::anchor())),
                )
                .unwrap(),
            )
            .unwrap();
        Ui::new(Arc::from("abcdefghijklmnopqrstu"), shared)
    }

    #[test]
    fn test_first_instance_installs_template() {
        let ui = ui();
        let first = ui.instantiate(1).unwrap();
        let second = ui.instantiate(1).unwrap();
        assert_ne!(first, second);

        let opcodes: Vec<_> = ui
            .take_commands()
            .iter()
            .map(|command| command.opcode())
            .collect();
        use tendril_protocol::Opcode::*;
        assert_eq!(opcodes, vec![InitWindow, InstallTemplate, InitBlock, InitBlock]);
    }

    #[test]
    fn test_unknown_template_and_target() {
        let ui = ui();
        assert_eq!(
            ui.instantiate(9),
            Err(SessionError::Block(BlockError::UnknownTemplate(9)))
        );
        let block = ui.instantiate(1).unwrap();
        assert!(matches!(
            ui.set_checked(block, 3, true),
            Err(SessionError::Block(BlockError::TargetOutOfRange { .. }))
        ));
        assert!(ui.set_checked(block, ROOT_TARGET, true).is_ok());
    }

    #[test]
    fn test_late_names_are_sent_inline() {
        let ui = ui();
        ui.take_commands();
        let block = ui.instantiate(1).unwrap();
        ui.set_style(block, 0, "color", "red").unwrap();
        ui.set_style(block, 0, "--accent", "blue").unwrap();

        let updates: Vec<_> = ui
            .take_commands()
            .into_iter()
            .filter_map(|command| match command {
                ServerCommand::ElementUpdate { update, .. } => Some(update),
                _ => None,
            })
            .collect();
        assert!(matches!(&updates[0], ElementUpdate::Style { key: Key::Code(_), .. }));
        assert_eq!(
            updates[1],
            ElementUpdate::Style {
                key: Key::Inline("--accent".into()),
                value: "blue".into()
            }
        );
        // interned for windows created later
        assert!(ui.shared().tables.table(TableKind::Styles).lookup("--accent").is_some());
    }

    #[test]
    fn test_rebinding_replaces_handler() {
        let ui = ui();
        let block = ui.instantiate(1).unwrap();
        let first = ui.on(block, ROOT_TARGET, "click", |_, _| {}).unwrap();
        let second = ui.on(block, ROOT_TARGET, "click", |_, _| {}).unwrap();
        assert_eq!(ui.handler_count(), 1);
        assert_ne!(second, first);
        assert!(ui.handler(first).is_none());
        assert!(ui.handler(second).is_some());

        assert_eq!(
            ui.on(block, ROOT_TARGET, "doubleclick-ish", |_, _| {}),
            Err(SessionError::UnknownEvent("doubleclick-ish".into()))
        );
    }

    #[test]
    fn test_late_event_for_removed_block_finds_no_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ui = ui();
        let graph = ReactiveGraph::new();
        let old_block = ui.instantiate(1).unwrap();
        let old = ui.on(old_block, ROOT_TARGET, "click", |_, _| {}).unwrap();
        ui.attach(ROOT_BLOCK, 0, vec![Content::Block(old_block)]).unwrap();
        ui.attach(ROOT_BLOCK, 0, Vec::new()).unwrap();
        ui.collect_released();
        assert_eq!(ui.handler_count(), 0);

        let runs = Arc::new(AtomicUsize::new(0));
        let new_block = ui.instantiate(1).unwrap();
        let counter = runs.clone();
        let new = ui
            .on(new_block, ROOT_TARGET, "click", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_ne!(new, old);

        // a click the client sent before it applied REMOVE_BLOCKS
        if let Some(handler) = ui.handler(old) {
            handler(&graph, &EventData::new(old, ""));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_ids_wrap_around_live_ids() {
        let ui = ui();
        let block = ui.instantiate(1).unwrap();
        let kept = ui.on(block, ROOT_TARGET, "click", |_, _| {}).unwrap();
        assert_eq!(kept, 0);
        ui.state.lock().next_handler = u16::MAX;

        let other = ui.instantiate(1).unwrap();
        assert_eq!(ui.on(other, ROOT_TARGET, "click", |_, _| {}).unwrap(), u16::MAX);
        // 0 is still bound, so the cursor skips it after wrapping
        assert_eq!(ui.on(other, ROOT_TARGET, "click", |_, _| {}).unwrap(), 1);
    }

    #[test]
    fn test_released_blocks_drop_handlers_and_scopes() {
        let ui = ui();
        let graph = ReactiveGraph::new();
        let (_root, block) = graph.create_root(|g| {
            let (block, ()) = ui.instantiate_scoped(g, 1, |g, _| {
                g.on_cleanup(|_| {});
            })
            .unwrap();
            ui.on(block, 0, "click", |_, _| {}).unwrap();
            ui.attach(ROOT_BLOCK, 0, vec![Content::Block(block)]).unwrap();
            block
        });
        assert!(ui.collect_released().is_empty());

        ui.attach(ROOT_BLOCK, 0, Vec::new()).unwrap();
        let scopes = ui.collect_released();
        assert_eq!(scopes.len(), 1);
        assert_eq!(ui.handler_count(), 0);
        assert_eq!(ui.block_count(), 0);
        assert!(matches!(
            ui.take_commands().last(),
            Some(ServerCommand::RemoveBlocks { blocks }) if blocks == &vec![block]
        ));
    }

    #[test]
    fn test_event_data_json() {
        let data = EventData::new(3, r#"{"value":"hi"}"#);
        let parsed: serde_json::Value = data.json().unwrap();
        assert_eq!(parsed["value"], "hi");
        assert_eq!(data.handler(), 3);
    }
}
