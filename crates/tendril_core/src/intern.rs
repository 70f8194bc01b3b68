//! Process-wide shared state
//!
//! Two read-mostly, append-only structures are shared by every window:
//!
//! - **String interning tables**: tag, attribute, style and event names map to
//!   small integer codes so the wire can carry `u16` keys instead of strings.
//! - **Definition cache**: compiled [`BlockDefinition`]s keyed by template id.
//!
//! Writers take a short exclusive lock; readers never block each other.
//! Entries are never removed or renumbered, so a prefix of a table observed
//! once stays valid for the lifetime of the process.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::block::{BlockDefinition, TemplateId};
use crate::error::{BlockError, Result};

/// Key value reserved to mean "inline string follows"
pub const INLINE_KEY: u16 = 0xFFFF;

/// Which interning table a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Tags,
    Attributes,
    Styles,
    Events,
}

impl TableKind {
    /// Tables in wire order
    pub const ALL: [TableKind; 4] = [
        TableKind::Tags,
        TableKind::Attributes,
        TableKind::Styles,
        TableKind::Events,
    ];

    /// Maximum number of entries the table may hold
    pub fn capacity(self) -> usize {
        match self {
            // event codes travel as a single byte
            TableKind::Events => usize::from(u8::MAX) + 1,
            _ => INLINE_KEY as usize,
        }
    }

    fn index(self) -> usize {
        match self {
            TableKind::Tags => 0,
            TableKind::Attributes => 1,
            TableKind::Styles => 2,
            TableKind::Events => 3,
        }
    }
}

#[derive(Default)]
struct TableInner {
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, u16>,
}

/// An append-only name table
pub struct InternTable {
    kind: TableKind,
    inner: RwLock<TableInner>,
}

impl InternTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            inner: RwLock::new(TableInner::default()),
        }
    }

    /// Get the code for `name`, appending it if missing
    ///
    /// Returns `None` once the table is full.
    pub fn intern(&self, name: &str) -> Option<u16> {
        if let Some(code) = self.lookup(name) {
            return Some(code);
        }

        let mut inner = self.inner.write();
        if let Some(code) = inner.index.get(name) {
            return Some(*code);
        }
        if inner.names.len() >= self.kind.capacity() {
            tracing::warn!(table = ?self.kind, name, "interning table full");
            return None;
        }
        let code = inner.names.len() as u16;
        let name: Arc<str> = Arc::from(name);
        inner.names.push(name.clone());
        inner.index.insert(name, code);
        Some(code)
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.inner.read().index.get(name).copied()
    }

    pub fn get(&self, code: u16) -> Option<Arc<str>> {
        self.inner.read().names.get(usize::from(code)).cloned()
    }

    /// The first `len` entries, in code order
    pub fn prefix(&self, len: usize) -> Vec<Arc<str>> {
        let inner = self.inner.read();
        inner.names[..len.min(inner.names.len())].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InternTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternTable")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

/// The four interning tables shared by every window
#[derive(Debug)]
pub struct InternTables {
    tables: [InternTable; 4],
}

/// Names present from process start, before any build index is loaded
const DEFAULT_TAGS: &[&str] = &[
    "div", "span", "p", "a", "button", "input", "label", "form", "ul", "ol", "li", "h1", "h2",
    "h3", "img", "section", "header", "footer", "nav", "main", "textarea", "select", "option",
];
const DEFAULT_ATTRIBUTES: &[&str] = &[
    "id", "class", "href", "src", "alt", "type", "value", "name", "placeholder", "title",
    "disabled", "for", "role", "tabindex",
];
const DEFAULT_STYLES: &[&str] = &[
    "display", "color", "background", "background-color", "width", "height", "margin", "padding",
    "opacity", "transform", "visibility",
];
const DEFAULT_EVENTS: &[&str] = &[
    "click", "input", "change", "submit", "keydown", "keyup", "focus", "blur", "mouseenter",
    "mouseleave",
];

impl InternTables {
    /// Empty tables
    pub fn new() -> Self {
        Self {
            tables: TableKind::ALL.map(InternTable::new),
        }
    }

    /// Tables seeded with common HTML names
    pub fn with_defaults() -> Self {
        let tables = Self::new();
        tables.seed(TableKind::Tags, DEFAULT_TAGS.iter().copied());
        tables.seed(TableKind::Attributes, DEFAULT_ATTRIBUTES.iter().copied());
        tables.seed(TableKind::Styles, DEFAULT_STYLES.iter().copied());
        tables.seed(TableKind::Events, DEFAULT_EVENTS.iter().copied());
        tables
    }

    /// Append names to a table in order
    pub fn seed<'a>(&self, kind: TableKind, names: impl IntoIterator<Item = &'a str>) {
        let table = self.table(kind);
        for name in names {
            if table.intern(name).is_none() {
                break;
            }
        }
    }

    pub fn table(&self, kind: TableKind) -> &InternTable {
        &self.tables[kind.index()]
    }

    /// Record how much of each table exists right now
    ///
    /// A window's client only knows the entries dumped in its INIT_WINDOW;
    /// anything interned later must be sent inline to that window.
    pub fn snapshot(&self) -> InternSnapshot {
        InternSnapshot {
            lengths: TableKind::ALL.map(|kind| self.table(kind).len()),
        }
    }
}

impl Default for InternTables {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Per-window view of the interning tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternSnapshot {
    lengths: [usize; 4],
}

impl InternSnapshot {
    pub fn len(&self, kind: TableKind) -> usize {
        self.lengths[kind.index()]
    }

    /// Code for `name` if this window's client knows it
    pub fn code(&self, tables: &InternTables, kind: TableKind, name: &str) -> Option<u16> {
        tables
            .table(kind)
            .lookup(name)
            .filter(|code| usize::from(*code) < self.len(kind))
    }

    /// The entries of one table as dumped to the client
    pub fn entries(&self, tables: &InternTables, kind: TableKind) -> Vec<Arc<str>> {
        tables.table(kind).prefix(self.len(kind))
    }
}

/// Shared cache of compiled block definitions
#[derive(Debug, Default)]
pub struct DefinitionCache {
    definitions: RwLock<FxHashMap<TemplateId, Arc<BlockDefinition>>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a definition
    ///
    /// Installing an identical definition again returns the cached one. A
    /// different definition under an existing id is rejected.
    pub fn install(&self, definition: BlockDefinition) -> Result<Arc<BlockDefinition>> {
        let id = definition.id();
        if let Some(existing) = self.get(id) {
            return Self::check_same(existing, &definition);
        }

        let mut definitions = self.definitions.write();
        if let Some(existing) = definitions.get(&id) {
            return Self::check_same(existing.clone(), &definition);
        }
        let definition = Arc::new(definition);
        definitions.insert(id, definition.clone());
        tracing::debug!(template = id, "block definition installed");
        Ok(definition)
    }

    fn check_same(
        existing: Arc<BlockDefinition>,
        definition: &BlockDefinition,
    ) -> Result<Arc<BlockDefinition>> {
        if *existing == *definition {
            Ok(existing)
        } else {
            Err(BlockError::TemplateConflict(definition.id()))
        }
    }

    pub fn get(&self, id: TemplateId) -> Option<Arc<BlockDefinition>> {
        self.definitions.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
