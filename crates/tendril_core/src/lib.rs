//! Tendril Core
//!
//! The two engines behind a server-driven UI session:
//!
//! - **Reactive graph**: signals, memos and effects with owner-scoped
//!   disposal, glitch-free push-then-pull propagation and error routing
//! - **Block model**: compiled templates with target/anchor addressing and a
//!   per-window registry of live block instances
//! - **Shared state**: string interning tables and the definition cache,
//!   shared read-mostly between windows
//!
//! # Example
//!
//! ```rust
//! use tendril_core::reactive::ReactiveGraph;
//!
//! let graph = ReactiveGraph::new();
//!
//! let (root, count) = graph.create_root(|g| {
//!     let count = g.create_signal(0i32);
//!     let doubled = g.create_memo(move |g| g.get(count).unwrap_or(0) * 2);
//!     g.create_effect(move |g| {
//!         println!("doubled is now: {:?}", g.get_memo(doubled));
//!     });
//!     count
//! });
//!
//! graph.set(count, 5);
//! graph.dispose_root(root);
//! ```

pub mod block;
pub mod error;
pub mod intern;
pub mod reactive;

pub use block::{
    BlockDefinition, BlockId, BlockRegistry, Content, InstallStep, StepKind, StepRole,
    TemplateId, TemplateNode, MAX_BLOCK_ID, MAX_TEXT_ITEM, ROOT_BLOCK, ROOT_TARGET,
};
pub use error::{BlockError, ReactiveError, Result};
pub use intern::{DefinitionCache, InternSnapshot, InternTable, InternTables, TableKind, INLINE_KEY};
pub use reactive::{
    create_context, BoxError, Context, Effect, LivenessToken, Memo, NodeId, ReactiveGraph,
    ReactiveStats, Root, Scope, Signal,
};
