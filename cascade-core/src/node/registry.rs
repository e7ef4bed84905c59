//! Definition Registry
//!
//! The registry is the definition store shared by every engine built from it.
//! It issues node tokens, records each node's definition (kind, seed value,
//! distinctness rule, value type) and keeps the list of node initializers:
//! deferred wiring that runs once per engine, the first time the engine
//! instantiates one of the initializer's nodes.
//!
//! # Layout
//!
//! Definitions and initializers live in two arenas indexed by
//! [`NodeId::index`] and [`InitializerId`]. A node's pending initializers are
//! a list of initializer ids stored next to its definition. Which initializers
//! already ran in which engine is tracked in a single set keyed by
//! `(EngineId, InitializerId)`, so two engines never share bookkeeping.
//!
//! Definitions are append-only: once declared, a node's definition never
//! changes.

use std::any::{self, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use super::distinct::Comparator;
use super::{Distinct, NodeId, NodeKind, NodeRef, Value};
use crate::engine::{Engine, EngineId, WeakEngine};
use crate::error::{EngineError, EngineResult};

/// Counter for generating unique registry ids.
static REGISTRY_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Deferred wiring run against an engine.
pub(crate) type Initializer = Rc<dyn Fn(&Engine) -> EngineResult<()>>;

/// Identifier of a registered node initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InitializerId(u32);

/// Where a node's value comes from when an engine instantiates it.
#[derive(Clone)]
pub(crate) enum Seed {
    /// No value until something writes one (streams, derived cells).
    Empty,
    /// A shared initial value.
    Value(Value),
    /// A fresh value per engine.
    Factory(Rc<dyn Fn() -> Value>),
}

/// The immutable description of a node.
#[derive(Clone)]
pub(crate) struct Definition {
    pub(crate) kind: NodeKind,
    pub(crate) seed: Seed,
    pub(crate) distinct: Option<Comparator>,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
}

impl Definition {
    /// Produce the value an engine stores when it instantiates this node.
    ///
    /// Factories run here, so a faulty factory surfaces on first access.
    pub(crate) fn seed_value(&self) -> Option<Value> {
        match &self.seed {
            Seed::Empty => None,
            Seed::Value(value) => Some(value.clone()),
            Seed::Factory(factory) => Some(factory()),
        }
    }

    /// Check that `value` has the type this node was declared with.
    pub(crate) fn check_type(&self, node: NodeId, value: &Value) -> EngineResult<()> {
        if value.payload_type() == self.type_id {
            Ok(())
        } else {
            Err(EngineError::TypeMismatch {
                node,
                expected: self.type_name,
            })
        }
    }
}

struct RegistryInner {
    id: u32,
    definitions: Vec<Definition>,
    labels: HashMap<usize, Rc<str>>,
    initializers: Vec<Initializer>,
    /// Initializer ids per node, indexed like `definitions`.
    pending: Vec<SmallVec<[InitializerId; 2]>>,
    /// `(engine, initializer)` pairs that already ran.
    ran: HashSet<(EngineId, InitializerId)>,
    /// Live engines built from this registry.
    engines: Vec<(EngineId, WeakEngine)>,
}

impl RegistryInner {
    fn check(&self, node: NodeId) -> EngineResult<()> {
        if node.registry() != self.id {
            return Err(EngineError::ForeignNode { node });
        }
        if node.index() >= self.definitions.len() {
            return Err(EngineError::UnknownNode { node });
        }
        Ok(())
    }

    fn push_initializer(&mut self, nodes: &[NodeId], init: Initializer) -> InitializerId {
        let id = InitializerId(self.initializers.len() as u32);
        self.initializers.push(init);
        for node in nodes {
            let slot = &mut self.pending[node.index()];
            if !slot.contains(&id) {
                slot.push(id);
            }
        }
        id
    }
}

/// The definition store that issues node tokens.
///
/// A `Registry` is a cheap handle; clones share the same store. Create the
/// nodes and the deferred wiring first, then build one or more
/// [`Engine`]s from the registry to hold their state.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use cascade_core::{Engine, Registry};
///
/// let registry = Registry::new();
/// let count = registry.cell(0);
/// let doubled = registry.pipe(count).map(|n: &i32| n * 2).into_node().unwrap();
///
/// let seen = Rc::new(Cell::new(0));
/// let seen_clone = seen.clone();
/// registry
///     .subscribe(doubled, move |n: &i32, _| seen_clone.set(*n))
///     .unwrap();
///
/// let engine = Engine::new(&registry);
/// engine.publish(count, 21).unwrap();
/// assert_eq!(seen.get(), 42);
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                id: REGISTRY_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                definitions: Vec::new(),
                labels: HashMap::new(),
                initializers: Vec::new(),
                pending: Vec::new(),
                ran: HashSet::new(),
                engines: Vec::new(),
            })),
        }
    }

    /// Number of nodes declared so far.
    pub fn len(&self) -> usize {
        self.inner.borrow().definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn declare<T: 'static>(
        &self,
        kind: NodeKind,
        seed: Seed,
        distinct: Option<Comparator>,
    ) -> NodeRef<T> {
        let mut inner = self.inner.borrow_mut();
        let id = NodeId::new(inner.id, inner.definitions.len() as u32);
        inner.definitions.push(Definition {
            kind,
            seed,
            distinct,
            type_id: TypeId::of::<T>(),
            type_name: any::type_name::<T>(),
        });
        inner.pending.push(SmallVec::new());
        NodeRef::from_id(id)
    }

    /// Declare a cell that suppresses values equal to its current one.
    pub fn cell<T: PartialEq + 'static>(&self, initial: T) -> NodeRef<T> {
        self.cell_with(initial, Distinct::by_eq())
    }

    /// Declare a cell with an explicit distinctness rule.
    pub fn cell_with<T: 'static>(&self, initial: T, distinct: Distinct<T>) -> NodeRef<T> {
        self.declare(
            NodeKind::Cell,
            Seed::Value(Value::new(initial)),
            distinct.into_comparator(),
        )
    }

    /// Declare a cell whose initial value is built by `factory`, once per
    /// engine, when the engine instantiates the cell.
    pub fn cell_from<T: PartialEq + 'static>(
        &self,
        factory: impl Fn() -> T + 'static,
    ) -> NodeRef<T> {
        self.declare(
            NodeKind::Cell,
            Seed::Factory(Rc::new(move || Value::new(factory()))),
            Distinct::<T>::by_eq().into_comparator(),
        )
    }

    /// Declare a cell that has no value until its initializer writes one.
    pub(crate) fn derived_cell<T: 'static>(&self) -> NodeRef<T> {
        self.declare(NodeKind::Cell, Seed::Empty, None)
    }

    /// Declare a stream that emits every value it resolves to.
    pub fn stream<T: 'static>(&self) -> NodeRef<T> {
        self.stream_with(Distinct::Never)
    }

    /// Declare a stream with an explicit distinctness rule.
    pub fn stream_with<T: 'static>(&self, distinct: Distinct<T>) -> NodeRef<T> {
        self.declare(NodeKind::Stream, Seed::Empty, distinct.into_comparator())
    }

    /// Declare a valueless stream that fires on every publish.
    pub fn trigger(&self) -> NodeRef<()> {
        self.declare(NodeKind::Trigger, Seed::Empty, None)
    }

    /// Attach a debug label to a node. Labelled nodes are traced at `debug`
    /// level when they resolve or are cancelled.
    pub fn label<T>(&self, node: NodeRef<T>, label: impl Into<String>) -> EngineResult<()> {
        let label: String = label.into();
        let mut inner = self.inner.borrow_mut();
        inner.check(node.id())?;
        inner.labels.insert(node.id().index(), Rc::from(label));
        Ok(())
    }

    pub(crate) fn label_of(&self, node: NodeId) -> Option<Rc<str>> {
        self.inner.borrow().labels.get(&node.index()).cloned()
    }

    pub(crate) fn definition(&self, node: NodeId) -> EngineResult<Definition> {
        let inner = self.inner.borrow();
        inner.check(node)?;
        Ok(inner.definitions[node.index()].clone())
    }

    pub(crate) fn kind(&self, node: NodeId) -> EngineResult<NodeKind> {
        let inner = self.inner.borrow();
        inner.check(node)?;
        Ok(inner.definitions[node.index()].kind)
    }

    /// Register `init` to run once per engine, the first time that engine
    /// instantiates any of `nodes`.
    ///
    /// Engines that already own one of the nodes run it immediately.
    pub fn register_initializer(
        &self,
        nodes: &[NodeId],
        init: impl Fn(&Engine) -> EngineResult<()> + 'static,
    ) -> EngineResult<InitializerId> {
        let init: Initializer = Rc::new(init);
        let id = {
            let mut inner = self.inner.borrow_mut();
            for node in nodes {
                inner.check(*node)?;
            }
            inner.push_initializer(nodes, Rc::clone(&init))
        };

        for engine in self.live_engines() {
            if !nodes.iter().any(|node| engine.owns(*node)) {
                continue;
            }
            if self.mark_ran(engine.id(), id) {
                init(&engine)?;
            }
        }
        Ok(id)
    }

    /// Claim the initializers of `node` that have not yet run in `engine`.
    pub(crate) fn take_pending(&self, engine: EngineId, node: NodeId) -> Vec<Initializer> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(ids) = inner.pending.get(node.index()) else {
            return Vec::new();
        };
        let (ran, initializers) = (&mut inner.ran, &inner.initializers);
        ids.iter()
            .filter(|id| ran.insert((engine, **id)))
            .map(|id| Rc::clone(&initializers[id.0 as usize]))
            .collect()
    }

    fn mark_ran(&self, engine: EngineId, init: InitializerId) -> bool {
        self.inner.borrow_mut().ran.insert((engine, init))
    }

    /// Whether `init` already ran in `engine`.
    pub fn has_run(&self, engine: EngineId, init: InitializerId) -> bool {
        self.inner.borrow().ran.contains(&(engine, init))
    }

    pub(crate) fn attach_engine(&self, engine: &Engine) {
        self.inner
            .borrow_mut()
            .engines
            .push((engine.id(), engine.downgrade()));
    }

    /// Drop all bookkeeping for `engine`.
    pub(crate) fn forget_engine(&self, engine: EngineId) {
        // Engines may be dropped while the registry is borrowed.
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.ran.retain(|(owner, _)| *owner != engine);
            inner
                .engines
                .retain(|(id, weak)| *id != engine && weak.is_alive());
        }
    }

    fn live_engines(&self) -> Vec<Engine> {
        self.inner
            .borrow()
            .engines
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Registry")
            .field("id", &inner.id)
            .field("nodes", &inner.definitions.len())
            .field("initializers", &inner.initializers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn tokens_are_unique_and_typed() {
        let registry = Registry::new();
        let a = registry.cell(1);
        let b = registry.stream::<String>();
        let c = registry.trigger();

        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
        assert_eq!(registry.len(), 3);

        let def = registry.definition(b.id()).unwrap();
        assert_eq!(def.kind, NodeKind::Stream);
        assert_eq!(def.type_id, TypeId::of::<String>());
        assert!(def.seed_value().is_none());
        assert_eq!(registry.kind(c.id()).unwrap(), NodeKind::Trigger);
    }

    #[test]
    fn cells_carry_their_seed_and_comparator() {
        let registry = Registry::new();
        let a = registry.cell(7u8);
        let def = registry.definition(a.id()).unwrap();

        let seed = def.seed_value().unwrap();
        assert_eq!(seed.downcast_ref::<u8>(), Some(&7));
        assert!(def.distinct.is_some());

        let b = registry.cell_with(7u8, Distinct::Never);
        assert!(registry.definition(b.id()).unwrap().distinct.is_none());
    }

    #[test]
    fn factories_run_per_seed() {
        let registry = Registry::new();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let node = registry.cell_from(move || {
            calls_clone.set(calls_clone.get() + 1);
            Vec::<u8>::new()
        });

        let def = registry.definition(node.id()).unwrap();
        assert_eq!(calls.get(), 0);
        def.seed_value();
        def.seed_value();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let ours = Registry::new();
        let theirs = Registry::new();
        let node = theirs.cell(0);

        assert_eq!(
            ours.definition(node.id()).err(),
            Some(EngineError::ForeignNode { node: node.id() })
        );
        assert!(ours.register_initializer(&[node.id()], |_| Ok(())).is_err());
    }

    #[test]
    fn pending_initializers_are_claimed_once_per_engine() {
        let registry = Registry::new();
        let a = registry.stream::<i32>();
        let b = registry.stream::<i32>();
        registry
            .register_initializer(&[a.id(), b.id()], |_| Ok(()))
            .unwrap();

        let first = EngineId::from_raw(100);
        let second = EngineId::from_raw(101);

        assert_eq!(registry.take_pending(first, a.id()).len(), 1);
        assert_eq!(registry.take_pending(first, b.id()).len(), 0);
        assert_eq!(registry.take_pending(second, b.id()).len(), 1);

        registry.forget_engine(first);
        assert_eq!(registry.take_pending(first, b.id()).len(), 1);
    }

    #[test]
    fn labels_are_recorded() {
        let registry = Registry::new();
        let node = registry.stream::<u8>();
        assert!(registry.label_of(node.id()).is_none());
        registry.label(node, "clicks").unwrap();
        assert_eq!(registry.label_of(node.id()).as_deref(), Some("clicks"));
    }

    #[test]
    fn foreign_tokens_cannot_be_labelled() {
        let ours = Registry::new();
        let theirs = Registry::new();
        let local = ours.stream::<u8>();
        let foreign = theirs.stream::<u8>();
        assert_eq!(local.id().index(), foreign.id().index());

        assert_eq!(
            ours.label(foreign, "clicks"),
            Err(EngineError::ForeignNode { node: foreign.id() })
        );
        assert!(ours.label_of(local.id()).is_none());
    }
}
