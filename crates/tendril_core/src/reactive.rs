//! Fine-grained reactive computation graph
//!
//! Inspired by SolidJS signals with automatic dependency tracking.
//! This implements a push-then-pull reactive system:
//! - Writes push STALE/PENDING marks through the graph
//! - Memos are re-evaluated top-down before any effect runs, so effects
//!   never observe a memo value that will change again in the same flush
//! - Effects are queued and run once per flush
//!
//! # Execution context
//!
//! A [`ReactiveGraph`] *is* the execution context: the current owner, the
//! current listener and the update queues all live on it. There is no
//! module-level state, so one graph per session can run on its own task
//! without sharing anything with other sessions.
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tendril_core::reactive::ReactiveGraph;
//!
//! let graph = ReactiveGraph::new();
//! let log = Arc::new(Mutex::new(Vec::new()));
//!
//! let (root, count) = graph.create_root(|g| {
//!     let count = g.create_signal(0i32);
//!     let doubled = g.create_memo(move |g| g.get(count).unwrap_or(0) * 2);
//!     let log = log.clone();
//!     g.create_effect(move |g| log.lock().unwrap().push(g.get_memo(doubled)));
//!     count
//! });
//!
//! graph.set(count, 5);
//! graph.set(count, 5);
//! assert_eq!(*log.lock().unwrap(), vec![Some(0), Some(10)]);
//!
//! graph.dispose_root(root);
//! ```

use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::{smallvec, SmallVec};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ReactiveError;

new_key_type! {
    /// Unique identifier for any node (signal, memo, effect, root or scope)
    pub struct NodeId;
}

/// Boxed error type accepted from fallible effects
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type AnyValue = Box<dyn Any + Send>;
type ContextValue = Arc<dyn Any + Send + Sync>;
type EqualsFn = fn(&(dyn Any + Send), &(dyn Any + Send)) -> bool;
type ComputeFn = Box<dyn FnMut(&ReactiveGraph) -> Result<AnyValue, BoxError> + Send>;
type CleanupFn = Box<dyn FnOnce(&ReactiveGraph) + Send>;
type ErrorHandler = Box<dyn FnMut(&ReactiveGraph, ReactiveError) + Send>;

/// Upper bound on computations executed by one flush
pub const MAX_RUNS_PER_FLUSH: usize = 100_000;

fn values_equal<T: PartialEq + 'static>(a: &(dyn Any + Send), b: &(dyn Any + Send)) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// What a node in the graph represents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Top-level owner with no parent
    Root,
    /// Owner created inside another owner that never re-runs by itself
    Scope,
    /// Plain reactive storage
    Signal,
    /// Pure computation whose result is itself observable
    Memo,
    /// Side-effecting computation
    Effect,
}

/// Freshness of a computation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Fresh,
    /// A direct source changed; must re-run
    Stale,
    /// An upstream memo may have changed; must check sources first
    Pending,
}

/// A reactive signal handle (cheap to copy)
#[derive(Debug)]
pub struct Signal<T> {
    id: NodeId,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> Signal<T> {
    /// Get the signal's node id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Reconstruct a Signal from a raw node id
    ///
    /// The caller must ensure the id refers to a signal of type T;
    /// a mismatched type reads as `None`.
    pub fn from_id(id: NodeId) -> Self {
        Signal {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

/// A memo (derived, cached value) handle
#[derive(Debug)]
pub struct Memo<T> {
    id: NodeId,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Memo<T> {}

impl<T> Memo<T> {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// An effect handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    id: NodeId,
}

impl Effect {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// A root owner handle; disposing it tears down everything created under it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    id: NodeId,
}

impl Root {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// A child owner handle created with [`ReactiveGraph::create_scope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    id: NodeId,
}

impl Scope {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A typed context key with a fallback value
///
/// Lookups walk the owner chain; the nearest provider wins.
#[derive(Debug, Clone)]
pub struct Context<T> {
    id: u64,
    default: T,
}

impl<T> Context<T> {
    pub fn new(default: T) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            default,
        }
    }

    /// The value returned when no provider is found
    pub fn default_value(&self) -> &T {
        &self.default
    }
}

/// Create a new context key
pub fn create_context<T>(default: T) -> Context<T> {
    Context::new(default)
}

/// Shared flag telling asynchronous work whether its owner is still alive
///
/// Tokens are invalidated when the owner they were created under is
/// re-run or disposed. Completion callbacks must check [`is_alive`]
/// before touching the graph.
///
/// [`is_alive`]: LivenessToken::is_alive
#[derive(Debug, Clone)]
pub struct LivenessToken {
    alive: Arc<AtomicBool>,
}

impl LivenessToken {
    /// A token that stays alive until explicitly invalidated
    pub fn detached() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Internal node storage
struct Node {
    kind: NodeKind,
    state: NodeState,
    /// Current value for signals and memos (type-erased)
    value: Option<AnyValue>,
    equals: Option<EqualsFn>,
    /// Taken out while the computation runs
    compute: Option<ComputeFn>,
    /// Computations reading this node, with the index of this node in their `sources`
    observers: Vec<NodeId>,
    observer_slots: Vec<usize>,
    /// Nodes this computation read, with the index of this node in their `observers`
    sources: Vec<NodeId>,
    source_slots: Vec<usize>,
    owner: Option<NodeId>,
    owned: SmallVec<[NodeId; 4]>,
    cleanups: Vec<CleanupFn>,
    contexts: Option<FxHashMap<u64, ContextValue>>,
    error_handler: Option<ErrorHandler>,
    /// Flush counter value of the last run (0 = never ran)
    updated_at: u64,
}

impl Node {
    fn new(kind: NodeKind, owner: Option<NodeId>) -> Self {
        Self {
            kind,
            state: NodeState::Fresh,
            value: None,
            equals: None,
            compute: None,
            observers: Vec::new(),
            observer_slots: Vec::new(),
            sources: Vec::new(),
            source_slots: Vec::new(),
            owner,
            owned: SmallVec::new(),
            cleanups: Vec::new(),
            contexts: None,
            error_handler: None,
            updated_at: 0,
        }
    }

    fn is_computation(&self) -> bool {
        matches!(self.kind, NodeKind::Memo | NodeKind::Effect)
    }
}

/// Restores owner and listener when a scope ends, even on unwind
struct ScopeRestore<'a> {
    graph: &'a ReactiveGraph,
    owner: Option<NodeId>,
    listener: Option<NodeId>,
}

impl Drop for ScopeRestore<'_> {
    fn drop(&mut self) {
        self.graph.owner.set(self.owner);
        self.graph.listener.set(self.listener);
    }
}

/// Clears the flushing flag if a batch body unwinds
struct FlushGuard<'a> {
    flushing: &'a Cell<bool>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flushing.set(false);
    }
}

/// The reactive graph that manages all signals, memos, effects and owners
pub struct ReactiveGraph {
    nodes: RefCell<SlotMap<NodeId, Node>>,
    /// Owner for nodes created right now
    owner: Cell<Option<NodeId>>,
    /// Computation that records reads right now
    listener: Cell<Option<NodeId>>,
    /// Memos waiting for re-evaluation
    updates: RefCell<VecDeque<NodeId>>,
    /// Effects waiting for re-evaluation
    effects: RefCell<Vec<NodeId>>,
    flushing: Cell<bool>,
    exec_count: Cell<u64>,
    runs_this_flush: Cell<usize>,
    uncaught: RefCell<Option<ReactiveError>>,
}

impl ReactiveGraph {
    /// Create a new reactive graph
    pub fn new() -> Self {
        Self {
            nodes: RefCell::new(SlotMap::with_key()),
            owner: Cell::new(None),
            listener: Cell::new(None),
            updates: RefCell::new(VecDeque::new()),
            effects: RefCell::new(Vec::new()),
            flushing: Cell::new(false),
            exec_count: Cell::new(1),
            runs_this_flush: Cell::new(0),
            uncaught: RefCell::new(None),
        }
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    /// Create a new signal owned by the current owner
    pub fn create_signal<T: PartialEq + Send + 'static>(&self, initial: T) -> Signal<T> {
        let mut node = Node::new(NodeKind::Signal, self.owner.get());
        node.value = Some(Box::new(initial));
        node.equals = Some(values_equal::<T>);
        Signal::from_id(self.insert_node(node))
    }

    /// Get the current value of a signal
    ///
    /// If called while a computation is tracking, the signal is recorded as
    /// one of its sources. Returns `None` once the signal has been disposed.
    pub fn get<T: Clone + 'static>(&self, signal: Signal<T>) -> Option<T> {
        self.track(signal.id);
        self.read_value(signal.id)
    }

    /// Get the current value without tracking as a dependency
    pub fn get_untracked<T: Clone + 'static>(&self, signal: Signal<T>) -> Option<T> {
        self.read_value(signal.id)
    }

    /// Set the value of a signal, triggering reactive updates
    ///
    /// Writing a value equal to the current one does nothing. Writing to a
    /// disposed signal is ignored. Returns whether the value changed.
    pub fn set<T: Send + 'static>(&self, signal: Signal<T>, value: T) -> bool {
        self.write(signal.id, Box::new(value))
    }

    /// Update a signal from its previous value
    pub fn update<T, F>(&self, signal: Signal<T>, f: F) -> bool
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) -> T,
    {
        match self.get_untracked(signal) {
            Some(current) => self.set(signal, f(current)),
            None => false,
        }
    }

    // =========================================================================
    // MEMOS
    // =========================================================================

    /// Create a memo, evaluated eagerly and cached until a source changes
    pub fn create_memo<T, F>(&self, compute: F) -> Memo<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: FnMut(&ReactiveGraph) -> T + Send + 'static,
    {
        let mut compute = compute;
        let mut node = Node::new(NodeKind::Memo, self.owner.get());
        node.equals = Some(values_equal::<T>);
        node.compute = Some(Box::new(move |graph: &ReactiveGraph| {
            Ok(Box::new(compute(graph)) as AnyValue)
        }));
        node.state = NodeState::Stale;
        let id = self.insert_node(node);
        self.warn_if_unowned(id, "memo");
        self.update_computation(id);
        Memo {
            id,
            _marker: std::marker::PhantomData,
        }
    }

    /// Get the value of a memo, re-evaluating it first if any source changed
    pub fn get_memo<T: Clone + 'static>(&self, memo: Memo<T>) -> Option<T> {
        self.refresh_memo(memo.id);
        self.track(memo.id);
        self.read_value(memo.id)
    }

    /// Get the value of a memo without tracking it
    pub fn get_memo_untracked<T: Clone + 'static>(&self, memo: Memo<T>) -> Option<T> {
        self.refresh_memo(memo.id);
        self.read_value(memo.id)
    }

    fn refresh_memo(&self, id: NodeId) {
        // Bounded: a memo that keeps invalidating itself is reported by the cycle check.
        for _ in 0..64 {
            match self.state_of(id) {
                Some(NodeState::Stale) => self.run_updates(|g| g.update_computation(id)),
                Some(NodeState::Pending) => self.run_updates(|g| g.look_upstream(id, None)),
                _ => return,
            }
        }
    }

    // =========================================================================
    // EFFECTS
    // =========================================================================

    /// Create an effect that runs now and again whenever a tracked source changes
    ///
    /// Inside a running flush (or batch) the first run is queued behind the
    /// current work instead of running inline.
    pub fn create_effect<F>(&self, run: F) -> Effect
    where
        F: FnMut(&ReactiveGraph) + Send + 'static,
    {
        let mut run = run;
        self.create_effect_node(Box::new(move |graph: &ReactiveGraph| {
            run(graph);
            Ok(Box::new(()) as AnyValue)
        }))
    }

    /// Create an effect that threads its previous result into the next run
    pub fn create_effect_with<T, F>(&self, initial: T, run: F) -> Effect
    where
        T: Send + 'static,
        F: FnMut(&ReactiveGraph, T) -> T + Send + 'static,
    {
        let mut run = run;
        let mut previous = Some(initial);
        self.create_effect(move |graph| {
            if let Some(value) = previous.take() {
                previous = Some(run(graph, value));
            }
        })
    }

    /// Create an effect whose errors are routed to the nearest error handler
    pub fn create_fallible_effect<F, E>(&self, run: F) -> Effect
    where
        F: FnMut(&ReactiveGraph) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let mut run = run;
        self.create_effect_node(Box::new(move |graph: &ReactiveGraph| {
            run(graph).map_err(Into::into)?;
            Ok(Box::new(()) as AnyValue)
        }))
    }

    fn create_effect_node(&self, compute: ComputeFn) -> Effect {
        let mut node = Node::new(NodeKind::Effect, self.owner.get());
        node.compute = Some(compute);
        node.state = NodeState::Stale;
        let id = self.insert_node(node);
        self.warn_if_unowned(id, "effect");

        if self.flushing.get() {
            self.effects.borrow_mut().push(id);
        } else {
            self.run_updates(|g| g.update_computation(id));
        }

        Effect { id }
    }

    /// Dispose of an effect, running its cleanups and removing it from the graph
    pub fn dispose_effect(&self, effect: Effect) {
        self.dispose(effect.id);
    }

    // =========================================================================
    // OWNERSHIP
    // =========================================================================

    /// Run `f` inside a new root owner
    ///
    /// Effects created by `f` have run by the time this returns.
    pub fn create_root<R>(&self, f: impl FnOnce(&ReactiveGraph) -> R) -> (Root, R) {
        let id = self
            .nodes
            .borrow_mut()
            .insert(Node::new(NodeKind::Root, None));
        let result = self.run_owned(id, f);
        (Root { id }, result)
    }

    /// Dispose a root, running every cleanup registered beneath it exactly once
    pub fn dispose_root(&self, root: Root) {
        self.dispose(root.id);
    }

    /// Run `f` inside a new child owner of the current owner
    pub fn create_scope<R>(&self, f: impl FnOnce(&ReactiveGraph) -> R) -> (Scope, R) {
        let id = self.insert_node(Node::new(NodeKind::Scope, self.owner.get()));
        let result = self.run_owned(id, f);
        (Scope { id }, result)
    }

    pub fn dispose_scope(&self, scope: Scope) {
        self.dispose(scope.id);
    }

    /// Run `f` with `owner` as the current owner, untracked
    ///
    /// Returns `None` if the owner has been disposed.
    pub fn with_owner<R>(&self, owner: NodeId, f: impl FnOnce(&ReactiveGraph) -> R) -> Option<R> {
        if !self.contains(owner) {
            return None;
        }
        Some(self.run_owned(owner, f))
    }

    /// The owner new nodes would be attached to right now
    pub fn current_owner(&self) -> Option<NodeId> {
        self.owner.get()
    }

    fn run_owned<R>(&self, owner: NodeId, f: impl FnOnce(&ReactiveGraph) -> R) -> R {
        let _restore = ScopeRestore {
            graph: self,
            owner: self.owner.replace(Some(owner)),
            listener: self.listener.replace(None),
        };
        self.run_updates(f)
    }

    /// Register a function to run when the current owner is next cleaned
    pub fn on_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce(&ReactiveGraph) + Send + 'static,
    {
        let Some(owner) = self.owner.get() else {
            tracing::warn!("cleanups created outside an owner will never run");
            return;
        };
        if let Some(node) = self.nodes.borrow_mut().get_mut(owner) {
            node.cleanups.push(Box::new(cleanup));
        }
    }

    /// Register an error handler on the current owner
    pub fn on_error<F>(&self, handler: F)
    where
        F: FnMut(&ReactiveGraph, ReactiveError) + Send + 'static,
    {
        let Some(owner) = self.owner.get() else {
            tracing::warn!("error handlers created outside an owner will never run");
            return;
        };
        if let Some(node) = self.nodes.borrow_mut().get_mut(owner) {
            node.error_handler = Some(Box::new(handler));
        }
    }

    /// Run `f` in a child scope whose errors go to `handler`
    pub fn catch_error<R, H>(&self, f: impl FnOnce(&ReactiveGraph) -> R, handler: H) -> R
    where
        H: FnMut(&ReactiveGraph, ReactiveError) + Send + 'static,
    {
        let (_, result) = self.create_scope(move |g| {
            g.on_error(handler);
            f(g)
        });
        result
    }

    /// Create a token that is invalidated when the current owner is cleaned
    pub fn liveness_token(&self) -> LivenessToken {
        let token = LivenessToken::detached();
        if self.owner.get().is_some() {
            let handle = token.clone();
            self.on_cleanup(move |_| handle.invalidate());
        } else {
            tracing::warn!("liveness token created outside an owner is never invalidated");
        }
        token
    }

    // =========================================================================
    // CONTEXT
    // =========================================================================

    /// Provide a context value on the current owner
    pub fn provide_context<T: Clone + Send + Sync + 'static>(&self, context: &Context<T>, value: T) {
        let Some(owner) = self.owner.get() else {
            tracing::warn!("context provided outside an owner is not visible to anything");
            return;
        };
        if let Some(node) = self.nodes.borrow_mut().get_mut(owner) {
            node.contexts
                .get_or_insert_with(FxHashMap::default)
                .insert(context.id, Arc::new(value));
        }
    }

    /// Run `f` in a child scope that provides `value` for `context`
    pub fn with_provider<T, R>(
        &self,
        context: &Context<T>,
        value: T,
        f: impl FnOnce(&ReactiveGraph) -> R,
    ) -> R
    where
        T: Clone + Send + Sync + 'static,
    {
        let (_, result) = self.create_scope(move |g| {
            g.provide_context(context, value);
            f(g)
        });
        result
    }

    /// Look up a context value on the owner chain, falling back to its default
    pub fn use_context<T: Clone + 'static>(&self, context: &Context<T>) -> T {
        let nodes = self.nodes.borrow();
        let mut cursor = self.owner.get();
        while let Some(id) = cursor {
            let Some(node) = nodes.get(id) else {
                break;
            };
            if let Some(value) = node
                .contexts
                .as_ref()
                .and_then(|contexts| contexts.get(&context.id))
                .and_then(|value| value.downcast_ref::<T>())
            {
                return value.clone();
            }
            cursor = node.owner;
        }
        context.default.clone()
    }

    // =========================================================================
    // TRACKING & BATCHING
    // =========================================================================

    /// Run `f` with dependency tracking suspended
    pub fn untrack<R>(&self, f: impl FnOnce(&ReactiveGraph) -> R) -> R {
        let _restore = ScopeRestore {
            graph: self,
            owner: self.owner.get(),
            listener: self.listener.replace(None),
        };
        f(self)
    }

    /// Run a function in a batch: every write inside is flushed once at the end
    pub fn batch<R>(&self, f: impl FnOnce(&ReactiveGraph) -> R) -> R {
        self.run_updates(f)
    }

    /// Run a batch and surface any error no handler caught
    ///
    /// An error left behind by a write made outside any batch is logged and
    /// discarded first; it is never reported as this batch's failure.
    pub fn try_batch<R>(&self, f: impl FnOnce(&ReactiveGraph) -> R) -> Result<R, ReactiveError> {
        if !self.flushing.get() {
            if let Some(stale) = self.take_error() {
                tracing::warn!(error = %stale, "discarding uncaught error from an unbatched write");
            }
        }
        let result = self.batch(f);
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Take the first error that reached the top of the owner chain
    pub fn take_error(&self) -> Option<ReactiveError> {
        self.uncaught.borrow_mut().take()
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    /// Whether a node is still alive
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.borrow().contains_key(id)
    }

    /// Number of computations currently observing a node
    pub fn observer_count(&self, id: NodeId) -> usize {
        self.nodes
            .borrow()
            .get(id)
            .map(|node| node.observers.len())
            .unwrap_or(0)
    }

    /// Number of sources a computation is currently subscribed to
    pub fn source_count(&self, id: NodeId) -> usize {
        self.nodes
            .borrow()
            .get(id)
            .map(|node| node.sources.len())
            .unwrap_or(0)
    }

    /// Get statistics about the reactive graph
    pub fn stats(&self) -> ReactiveStats {
        let nodes = self.nodes.borrow();
        let mut stats = ReactiveStats {
            pending_updates: self.updates.borrow().len(),
            pending_effects: self.effects.borrow().len(),
            flush_count: self.exec_count.get() - 1,
            ..ReactiveStats::default()
        };
        for node in nodes.values() {
            match node.kind {
                NodeKind::Root | NodeKind::Scope => stats.owner_count += 1,
                NodeKind::Signal => stats.signal_count += 1,
                NodeKind::Memo => stats.memo_count += 1,
                NodeKind::Effect => stats.effect_count += 1,
            }
        }
        stats
    }

    // =========================================================================
    // INTERNAL: storage & links
    // =========================================================================

    fn insert_node(&self, node: Node) -> NodeId {
        let owner = node.owner;
        let mut nodes = self.nodes.borrow_mut();
        let id = nodes.insert(node);
        if let Some(owner) = owner.and_then(|owner| nodes.get_mut(owner)) {
            owner.owned.push(id);
        }
        id
    }

    fn warn_if_unowned(&self, id: NodeId, what: &str) {
        if self.owner.get().is_none() {
            tracing::warn!(node = ?id, "{what} created outside a root will never be disposed");
        }
    }

    fn read_value<T: Clone + 'static>(&self, id: NodeId) -> Option<T> {
        self.nodes
            .borrow()
            .get(id)
            .and_then(|node| node.value.as_ref())
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    fn state_of(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.borrow().get(id).map(|node| node.state)
    }

    fn track(&self, source: NodeId) {
        if let Some(listener) = self.listener.get() {
            self.link(source, listener);
        }
    }

    /// Subscribe `observer` to `source`, recording each side's slot in the other
    fn link(&self, source: NodeId, observer: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if !nodes.contains_key(source) || !nodes.contains_key(observer) {
            return;
        }
        if nodes[observer].sources.last() == Some(&source) {
            return;
        }
        let source_slot = nodes[source].observers.len();
        let observer_slot = nodes[observer].sources.len();
        nodes[observer].sources.push(source);
        nodes[observer].source_slots.push(source_slot);
        nodes[source].observers.push(observer);
        nodes[source].observer_slots.push(observer_slot);
    }

    /// Drop every source of a computation
    fn unlink_sources(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        loop {
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            let (Some(source), Some(index)) = (node.sources.pop(), node.source_slots.pop()) else {
                return;
            };
            let Some(src) = nodes.get_mut(source) else {
                continue;
            };
            if index >= src.observers.len() {
                continue;
            }
            src.observers.swap_remove(index);
            src.observer_slots.swap_remove(index);
            if index < src.observers.len() {
                let moved = src.observers[index];
                let moved_slot = src.observer_slots[index];
                if let Some(observer) = nodes.get_mut(moved) {
                    observer.source_slots[moved_slot] = index;
                }
            }
        }
    }

    /// Drop every observer of a signal or memo
    fn unlink_observers(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        loop {
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            let (Some(observer), Some(index)) = (node.observers.pop(), node.observer_slots.pop())
            else {
                return;
            };
            let Some(obs) = nodes.get_mut(observer) else {
                continue;
            };
            if index >= obs.sources.len() {
                continue;
            }
            obs.sources.swap_remove(index);
            obs.source_slots.swap_remove(index);
            if index < obs.sources.len() {
                let moved = obs.sources[index];
                let moved_slot = obs.source_slots[index];
                if let Some(source) = nodes.get_mut(moved) {
                    source.observer_slots[moved_slot] = index;
                }
            }
        }
    }

    // =========================================================================
    // INTERNAL: propagation
    // =========================================================================

    fn write(&self, id: NodeId, value: AnyValue) -> bool {
        let observers: SmallVec<[NodeId; 8]> = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                tracing::trace!(node = ?id, "write to disposed node ignored");
                return false;
            };
            if let (Some(equals), Some(current)) = (node.equals, node.value.as_deref()) {
                if equals(current, value.as_ref()) {
                    return false;
                }
            }
            node.value = Some(value);
            node.observers.iter().copied().collect()
        };

        if !observers.is_empty() {
            self.run_updates(|g| {
                for observer in observers {
                    g.mark_stale(observer);
                }
            });
        }
        true
    }

    fn enqueue(&self, id: NodeId, kind: NodeKind) {
        if kind == NodeKind::Memo {
            self.updates.borrow_mut().push_back(id);
        } else {
            self.effects.borrow_mut().push(id);
        }
    }

    /// Mark a direct observer STALE and everything downstream PENDING
    fn mark_stale(&self, id: NodeId) {
        let (was_fresh, kind, has_observers) = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            let was_fresh = node.state == NodeState::Fresh;
            node.state = NodeState::Stale;
            (was_fresh, node.kind, !node.observers.is_empty())
        };
        if was_fresh {
            self.enqueue(id, kind);
            if has_observers {
                self.mark_downstream(id);
            }
        }
    }

    fn mark_downstream(&self, id: NodeId) {
        let observers: SmallVec<[NodeId; 8]> = match self.nodes.borrow().get(id) {
            Some(node) => node.observers.iter().copied().collect(),
            None => return,
        };
        for observer in observers {
            let queued = {
                let mut nodes = self.nodes.borrow_mut();
                match nodes.get_mut(observer) {
                    Some(node) if node.state == NodeState::Fresh => {
                        node.state = NodeState::Pending;
                        Some((node.kind, !node.observers.is_empty()))
                    }
                    _ => None,
                }
            };
            if let Some((kind, has_observers)) = queued {
                self.enqueue(observer, kind);
                if has_observers {
                    self.mark_downstream(observer);
                }
            }
        }
    }

    /// Run `f`, then flush; nested calls join the outer flush
    fn run_updates<R>(&self, f: impl FnOnce(&ReactiveGraph) -> R) -> R {
        if self.flushing.get() {
            return f(self);
        }
        self.flushing.set(true);
        let _guard = FlushGuard {
            flushing: &self.flushing,
        };
        self.exec_count.set(self.exec_count.get() + 1);
        self.runs_this_flush.set(0);
        let result = f(self);
        self.complete_updates();
        result
    }

    fn complete_updates(&self) {
        loop {
            loop {
                let next = self.updates.borrow_mut().pop_front();
                let Some(id) = next else {
                    break;
                };
                self.run_top(id);
                if self.cycle_tripped() {
                    return;
                }
            }

            let effects = std::mem::take(&mut *self.effects.borrow_mut());
            if effects.is_empty() {
                if self.updates.borrow().is_empty() {
                    return;
                }
                continue;
            }

            self.exec_count.set(self.exec_count.get() + 1);
            for id in effects {
                self.run_top(id);
                if self.cycle_tripped() {
                    return;
                }
            }
        }
    }

    fn cycle_tripped(&self) -> bool {
        if self.runs_this_flush.get() <= MAX_RUNS_PER_FLUSH {
            return false;
        }
        self.updates.borrow_mut().clear();
        self.effects.borrow_mut().clear();
        tracing::error!(limit = MAX_RUNS_PER_FLUSH, "reactive flush aborted");
        self.park_error(ReactiveError::PotentialCycle {
            limit: MAX_RUNS_PER_FLUSH,
        });
        true
    }

    /// Bring a queued computation up to date, updating stale owners first
    fn run_top(&self, id: NodeId) {
        let (state, mut cursor) = match self.nodes.borrow().get(id) {
            Some(node) => (node.state, node.owner),
            None => return,
        };
        match state {
            NodeState::Fresh => return,
            NodeState::Pending => {
                self.look_upstream(id, None);
                return;
            }
            NodeState::Stale => {}
        }

        let exec = self.exec_count.get();
        let mut ancestors: SmallVec<[NodeId; 8]> = smallvec![id];
        {
            let nodes = self.nodes.borrow();
            while let Some(owner) = cursor {
                let Some(node) = nodes.get(owner) else {
                    break;
                };
                if node.updated_at != 0 && node.updated_at >= exec {
                    break;
                }
                if node.state != NodeState::Fresh {
                    ancestors.push(owner);
                }
                cursor = node.owner;
            }
        }

        for &node in ancestors.iter().rev() {
            match self.state_of(node) {
                Some(NodeState::Stale) => self.update_computation(node),
                Some(NodeState::Pending) => self.look_upstream(node, Some(id)),
                _ => {}
            }
        }
    }

    /// Resolve a PENDING node by updating any stale memo it reads
    fn look_upstream(&self, id: NodeId, ignore: Option<NodeId>) {
        let sources: SmallVec<[NodeId; 8]> = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            node.state = NodeState::Fresh;
            node.sources.iter().copied().collect()
        };
        let exec = self.exec_count.get();
        for source in sources {
            let info = self
                .nodes
                .borrow()
                .get(source)
                .filter(|node| node.kind == NodeKind::Memo)
                .map(|node| (node.state, node.updated_at));
            match info {
                Some((NodeState::Stale, updated_at)) => {
                    if Some(source) != ignore && (updated_at == 0 || updated_at < exec) {
                        self.run_top(source);
                    }
                }
                Some((NodeState::Pending, _)) => self.look_upstream(source, ignore),
                _ => {}
            }
        }
    }

    fn update_computation(&self, id: NodeId) {
        let compute = self
            .nodes
            .borrow_mut()
            .get_mut(id)
            .and_then(|node| node.compute.take());
        let Some(mut compute) = compute else {
            return;
        };

        self.clean_node(id);
        self.runs_this_flush.set(self.runs_this_flush.get() + 1);
        let exec = self.exec_count.get();

        let outcome = {
            let _restore = ScopeRestore {
                graph: self,
                owner: self.owner.replace(Some(id)),
                listener: self.listener.replace(Some(id)),
            };
            panic::catch_unwind(AssertUnwindSafe(|| compute(self)))
        };

        let kind = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                tracing::trace!(node = ?id, "computation disposed while running");
                return;
            };
            node.compute = Some(compute);
            node.updated_at = exec;
            node.kind
        };

        match outcome {
            Ok(Ok(value)) => {
                if kind == NodeKind::Memo {
                    self.write(id, value);
                }
            }
            Ok(Err(err)) => self.handle_error(
                id,
                ReactiveError::Computation {
                    message: err.to_string(),
                },
            ),
            Err(payload) => self.handle_error(
                id,
                ReactiveError::Panicked {
                    message: panic_message(payload.as_ref()),
                },
            ),
        }
    }

    /// Route an error to the nearest handler on the owner chain
    fn handle_error(&self, id: NodeId, err: ReactiveError) {
        let mut cursor = Some(id);
        while let Some(owner) = cursor {
            let handler = {
                let mut nodes = self.nodes.borrow_mut();
                let Some(node) = nodes.get_mut(owner) else {
                    break;
                };
                cursor = node.owner;
                node.error_handler.take()
            };
            let Some(mut handler) = handler else {
                continue;
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self, err)));
            if let Some(node) = self.nodes.borrow_mut().get_mut(owner) {
                if node.error_handler.is_none() {
                    node.error_handler = Some(handler);
                }
            }
            if let Err(payload) = outcome {
                self.park_error(ReactiveError::Panicked {
                    message: panic_message(payload.as_ref()),
                });
            }
            return;
        }

        tracing::debug!(node = ?id, error = %err, "reactive error reached the top of its owner chain");
        self.park_error(err);
    }

    fn park_error(&self, err: ReactiveError) {
        let mut slot = self.uncaught.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            tracing::error!(error = %err, "additional uncaught reactive error dropped");
        }
    }

    // =========================================================================
    // INTERNAL: disposal
    // =========================================================================

    fn dispose(&self, id: NodeId) {
        let owner = match self.nodes.borrow().get(id) {
            Some(node) => node.owner,
            None => return,
        };
        if let Some(owner) = owner {
            if let Some(node) = self.nodes.borrow_mut().get_mut(owner) {
                node.owned.retain(|child| *child != id);
            }
        }
        self.run_updates(|g| g.dispose_node(id));
    }

    /// Run cleanups, dispose owned children and drop sources
    fn clean_node(&self, id: NodeId) {
        self.unlink_sources(id);

        let owned = self
            .nodes
            .borrow_mut()
            .get_mut(id)
            .map(|node| std::mem::take(&mut node.owned))
            .unwrap_or_default();
        for child in owned.into_iter().rev() {
            self.dispose_node(child);
        }

        let cleanups = self
            .nodes
            .borrow_mut()
            .get_mut(id)
            .map(|node| std::mem::take(&mut node.cleanups))
            .unwrap_or_default();
        for cleanup in cleanups.into_iter().rev() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cleanup(self))) {
                self.park_error(ReactiveError::Panicked {
                    message: panic_message(payload.as_ref()),
                });
            }
        }

        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.state = NodeState::Fresh;
            if node.is_computation() {
                node.contexts = None;
                node.error_handler = None;
            }
        }
    }

    fn dispose_node(&self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        self.clean_node(id);
        self.unlink_observers(id);
        self.nodes.borrow_mut().remove(id);
    }
}

impl Default for ReactiveGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReactiveGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveGraph")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics about the reactive graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactiveStats {
    pub owner_count: usize,
    pub signal_count: usize,
    pub memo_count: usize,
    pub effect_count: usize,
    pub pending_updates: usize,
    pub pending_effects: usize,
    pub flush_count: u64,
}
