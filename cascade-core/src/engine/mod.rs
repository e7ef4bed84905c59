//! Engine
//!
//! An [`Engine`] holds the instance state of the nodes declared in a
//! [`Registry`]: persisted cell values, the stream values of the running
//! cycle, the projection graph, subscriptions and the memoised execution
//! plans.
//!
//! # Ownership
//!
//! Engines form a tree. A node is *owned* by the nearest engine, looking from
//! an engine up through its ancestors, in which the node was instantiated.
//! Reads, writes and subscriptions for a node owned by an ancestor are
//! delegated to that ancestor, so a child never duplicates its parent's state.
//!
//! # Re-entrancy
//!
//! Engine state sits behind a `RefCell`. No borrow is ever held while user
//! code runs (transforms, subscribers, initializers, factories), so any of
//! them may call back into the engine, including starting a nested publish.
//!
//! # Lifecycle
//!
//! [`Engine::dispose`] detaches the engine from its parent, runs the dispose
//! callbacks, drops all instance state and detaches (without disposing) its
//! children. Every later operation fails with [`EngineError::Disposed`].

mod combine;
mod publish;
mod subscription;

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::debug;

pub use combine::Combined;
pub use subscription::{Subscription, SubscriptionId};

pub(crate) use subscription::Callback;

use crate::error::{EngineError, EngineResult};
use crate::graph::{Connection, ExecutionPlan, Graph, NodeInfo, PlanContext, Projection, ProjectionId};
use crate::node::{Batch, Comparator, Distinct, NodeId, NodeKind, NodeRef, Registry, Value};

/// Unique identifier of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(u64);

impl EngineId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Construction options for an [`Engine`].
#[derive(Default)]
pub struct EngineConfig {
    /// A stable, caller-chosen name for the engine.
    pub id: Option<String>,

    /// Cell values written straight into the store at construction, without
    /// running a propagation cycle.
    pub initial_values: Batch,

    /// The engine to delegate ancestor-owned nodes to.
    pub parent: Option<Engine>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_initial_values(mut self, values: Batch) -> Self {
        self.initial_values = values;
        self
    }

    pub fn with_parent(mut self, parent: &Engine) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

/// Per-engine instance state. Replaced wholesale on dispose.
#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) owned: HashSet<NodeId>,
    pub(crate) cells: HashMap<NodeId, Value>,
    /// `None` between cycles, `Some` while the running cycle has emitted.
    pub(crate) streams: HashMap<NodeId, Option<Value>>,
    pub(crate) graph: Graph,
    pub(crate) distinct_overrides: HashMap<NodeId, Option<Comparator>>,
    pub(crate) subscribers: HashMap<NodeId, IndexMap<SubscriptionId, Callback>>,
    pub(crate) singletons: HashMap<NodeId, (SubscriptionId, Callback)>,
    /// Memoised `combine_cells` sinks, keyed by their exact source sequence.
    pub(crate) combined: HashMap<Vec<NodeId>, NodeId>,
    /// Execution plans keyed by the sorted root set.
    pub(crate) plans: HashMap<Vec<NodeId>, Rc<ExecutionPlan>>,
}

impl EngineState {
    fn read(&self, node: NodeId) -> Option<Value> {
        match self.cells.get(&node) {
            Some(value) => Some(value.clone()),
            None => self.streams.get(&node).cloned().flatten(),
        }
    }
}

pub(crate) struct EngineInner {
    id: EngineId,
    name: Option<String>,
    registry: Registry,
    disposed: Cell<bool>,
    state: RefCell<EngineState>,
    parent: RefCell<Option<Engine>>,
    children: RefCell<Vec<Weak<EngineInner>>>,
    dispose_callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.registry.forget_engine(self.id);
    }
}

/// A reactive engine holding the instance state of a registry's nodes.
///
/// `Engine` is a cheap handle; clones refer to the same engine.
///
/// # Example
///
/// ```rust
/// use cascade_core::{Engine, EngineConfig, Registry};
///
/// let registry = Registry::new();
/// let name = registry.cell(String::from("foo"));
///
/// let parent = Engine::new(&registry);
/// parent.publish(name, "bar".to_string()).unwrap();
///
/// let child = Engine::with_config(&registry, EngineConfig::new().with_parent(&parent)).unwrap();
/// assert_eq!(child.get_value(name).unwrap(), "bar");
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

/// A non-owning handle to an [`Engine`].
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }

    /// Whether the engine is still alive and not disposed.
    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| !inner.disposed.get())
            .unwrap_or(false)
    }
}

impl fmt::Debug for WeakEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEngine")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Engine {
    /// Create a root engine with no initial values.
    pub fn new(registry: &Registry) -> Self {
        let engine = Self::build(registry, None, None);
        registry.attach_engine(&engine);
        engine
    }

    /// Create an engine from a full configuration.
    ///
    /// Fails if the parent is disposed, or if an initial value targets a
    /// node that is not a cell or has the wrong type.
    pub fn with_config(registry: &Registry, config: EngineConfig) -> EngineResult<Self> {
        if let Some(parent) = &config.parent {
            parent.ensure_live()?;
        }

        let parent = config.parent;
        let engine = Self::build(registry, config.id, parent.clone());
        if let Some(parent) = parent {
            parent
                .inner
                .children
                .borrow_mut()
                .push(Rc::downgrade(&engine.inner));
        }
        registry.attach_engine(&engine);

        for (node, value) in config.initial_values.into_entries() {
            engine.overwrite(node, value)?;
        }
        Ok(engine)
    }

    fn build(registry: &Registry, name: Option<String>, parent: Option<Engine>) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                id: EngineId::next(),
                name,
                registry: registry.clone(),
                disposed: Cell::new(false),
                state: RefCell::new(EngineState::default()),
                parent: RefCell::new(parent),
                children: RefCell::new(Vec::new()),
                dispose_callbacks: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> EngineId {
        self.inner.id
    }

    /// The stable name given in [`EngineConfig::id`].
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn parent(&self) -> Option<Engine> {
        self.inner.parent.borrow().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub(crate) fn ensure_live(&self) -> EngineResult<()> {
        if self.is_disposed() {
            Err(EngineError::Disposed(self.id()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn state(&self) -> Ref<'_, EngineState> {
        self.inner.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, EngineState> {
        self.inner.state.borrow_mut()
    }

    /// Whether this engine itself holds the instance state of `node`.
    pub fn owns(&self, node: NodeId) -> bool {
        self.state().owned.contains(&node)
    }

    /// The nearest engine, starting with this one, that owns `node`.
    pub fn owner_of(&self, node: NodeId) -> Option<Engine> {
        let mut current = Some(self.clone());
        while let Some(engine) = current {
            if engine.owns(node) {
                return Some(engine);
            }
            current = engine.parent();
        }
        None
    }

    /// Instantiate `node` in this engine unless it or an ancestor already
    /// owns it.
    pub fn register<T>(&self, node: NodeRef<T>) -> EngineResult<()> {
        self.instantiate(node.id()).map(|_| ())
    }

    /// Returns `true` if this call created the instance state.
    pub(crate) fn instantiate(&self, node: NodeId) -> EngineResult<bool> {
        self.ensure_live()?;
        if self.owner_of(node).is_some() {
            return Ok(false);
        }

        let registry = &self.inner.registry;
        let definition = registry.definition(node)?;
        let seed = definition.seed_value();
        {
            let mut state = self.state_mut();
            state.owned.insert(node);
            match definition.kind {
                NodeKind::Cell => {
                    if let Some(seed) = seed {
                        state.cells.insert(node, seed);
                    }
                }
                NodeKind::Stream | NodeKind::Trigger => {
                    state.streams.insert(node, None);
                }
            }
        }
        if let Some(label) = registry.label_of(node) {
            debug!(engine = %self.id(), %node, label = &*label, "node registered");
        }

        for init in registry.take_pending(self.id(), node) {
            init(self)?;
        }
        Ok(true)
    }

    /// The current value of `node`, read from its owning engine.
    ///
    /// Streams only hold a value while the cycle that emitted them runs;
    /// outside of one, reading a stream yields [`EngineError::Empty`].
    pub fn get_value<T: Clone + 'static>(&self, node: NodeRef<T>) -> EngineResult<T> {
        let id = node.id();
        self.instantiate(id)?;
        self.current_value(id)
            .ok_or(EngineError::Empty { node: id })?
            .read::<T>(id)
    }

    pub(crate) fn current_value(&self, node: NodeId) -> Option<Value> {
        self.owner_of(node)
            .and_then(|owner| owner.state().read(node))
    }

    /// Write a cell value into its owner's store without running a cycle.
    pub(crate) fn overwrite(&self, node: NodeId, value: Value) -> EngineResult<()> {
        let definition = self.inner.registry.definition(node)?;
        if definition.kind != NodeKind::Cell {
            return Err(EngineError::NotACell { node });
        }
        definition.check_type(node, &value)?;

        self.instantiate(node)?;
        let owner = self.owner_of(node).ok_or(EngineError::UnknownNode { node })?;
        owner.state_mut().cells.insert(node, value);
        Ok(())
    }

    /// Add a projection to this engine's graph.
    ///
    /// The sink, sources and pulls are instantiated first. Fails with
    /// [`EngineError::Cycle`] if the projection's active sources are
    /// reachable from its sink. Every cached execution plan is dropped.
    pub fn connect(&self, connection: Connection) -> EngineResult<ProjectionId> {
        self.ensure_live()?;
        self.instantiate(connection.sink)?;
        for node in connection.sources.iter().chain(connection.pulls.iter()) {
            self.instantiate(*node)?;
        }

        let projection = Rc::new(connection.into_projection());
        let id = projection.id;
        let mut state = self.state_mut();
        if let Some(upstream) = state.graph.would_cycle(&projection.sources, projection.sink) {
            return Err(EngineError::Cycle {
                upstream,
                sink: projection.sink,
            });
        }
        state.graph.insert(projection);
        state.plans.clear();
        Ok(id)
    }

    /// Replace the distinctness rule of `node` in this engine only.
    pub fn override_distinct<T: 'static>(
        &self,
        node: NodeRef<T>,
        distinct: Distinct<T>,
    ) -> EngineResult<()> {
        self.ensure_live()?;
        let mut state = self.state_mut();
        state
            .distinct_overrides
            .insert(node.id(), distinct.into_comparator());
        state.plans.clear();
        Ok(())
    }

    /// Run `callback` once, when the engine is disposed.
    pub fn on_dispose(&self, callback: impl FnOnce() + 'static) -> EngineResult<()> {
        self.ensure_live()?;
        self.inner
            .dispose_callbacks
            .borrow_mut()
            .push(Box::new(callback));
        Ok(())
    }

    /// Tear the engine down. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }

        let parent = self.inner.parent.borrow_mut().take();
        if let Some(parent) = parent {
            let id = self.id();
            parent
                .inner
                .children
                .borrow_mut()
                .retain(|child| child.upgrade().map(|c| c.id != id).unwrap_or(false));
        }

        let callbacks = mem::take(&mut *self.inner.dispose_callbacks.borrow_mut());
        for callback in callbacks {
            callback();
        }

        let state = mem::take(&mut *self.inner.state.borrow_mut());
        drop(state);
        self.inner.registry.forget_engine(self.id());

        let children = mem::take(&mut *self.inner.children.borrow_mut());
        for child in children.iter().filter_map(Weak::upgrade) {
            let detached = child.parent.borrow_mut().take();
            drop(detached);
        }
        debug!(engine = %self.id(), "engine disposed");
    }

    pub(crate) fn live_children(&self) -> Vec<Engine> {
        self.inner
            .children
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|inner| !inner.disposed.get())
            .map(|inner| Engine { inner })
            .collect()
    }

    /// Fetch or build the plan for a sorted root set.
    pub(crate) fn plan_for(&self, roots: Vec<NodeId>) -> EngineResult<Rc<ExecutionPlan>> {
        let cached = self.state().plans.get(&roots).cloned();
        if let Some(plan) = cached {
            tracing::trace!(engine = %self.id(), "execution plan cache hit");
            return Ok(plan);
        }

        let plan = Rc::new(crate::graph::build_plan(self, &roots)?);
        self.state_mut().plans.insert(roots, Rc::clone(&plan));
        Ok(plan)
    }
}

impl PlanContext for Engine {
    fn register(&self, node: NodeId) -> EngineResult<bool> {
        self.instantiate(node)
    }

    fn consumers(&self, node: NodeId) -> Vec<Rc<Projection>> {
        self.state().graph.consumers(node).to_vec()
    }

    fn describe(&self, node: NodeId) -> EngineResult<NodeInfo> {
        let registry = &self.inner.registry;
        let definition = registry.definition(node)?;
        let comparator = match self.state().distinct_overrides.get(&node) {
            Some(comparator) => comparator.clone(),
            None => definition.distinct.clone(),
        };
        Ok(NodeInfo {
            kind: definition.kind,
            type_id: definition.type_id,
            type_name: definition.type_name,
            comparator,
            label: registry.label_of(node),
        })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Engine");
        debug
            .field("id", &self.id())
            .field("name", &self.name())
            .field("disposed", &self.is_disposed());
        if let Ok(state) = self.inner.state.try_borrow() {
            debug
                .field("nodes", &state.owned.len())
                .field("projections", &state.graph.len());
        }
        debug.finish()
    }
}
