//! Publish Scheduler
//!
//! A publish runs one propagation cycle over the execution plan of its roots.
//!
//! # How a Cycle Runs
//!
//! 1. Entries for nodes owned by an ancestor are forwarded to the parent.
//!    The rest are planned locally.
//!
//! 2. A scratch map is seeded with the current value of every node the plan
//!    may read. Transforms read from scratch, never from the store.
//!
//! 3. Nodes are visited in plan order. Roots resolve to their published
//!    value; every other node runs the projections feeding it whose active
//!    sources resolved, and the last one to produce a value wins.
//!
//! 4. A resolved value passes the node's distinctness rule, is persisted if
//!    this engine owns the node, and is handed to the node's subscribers.
//!
//! 5. A node that does not resolve is cancelled: each projection it drives
//!    releases one reference on its sink, and a sink with no references left
//!    is cancelled in turn without running its transforms.
//!
//! 6. A resolved node owned by an ancestor is not committed here. Its value
//!    is forwarded to the parent once the plan is exhausted, and local
//!    readers see it when the parent publishes it back down.
//!
//! 7. Once the plan is exhausted, the values that changed are published into
//!    every child engine.
//!
//! Streams hold their value only while the cycle that emitted them runs; a
//! guard resets them when the cycle ends, including on error.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, debug_span};

use super::Engine;
use crate::error::{EngineError, EngineResult};
use crate::graph::{ExecutionPlan, Inputs};
use crate::node::{Batch, NodeId, NodeKind, NodeRef, Value};

/// Who asked for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// An external caller.
    Caller,
    /// A child engine forwarding entries owned here or above.
    Child,
    /// The parent engine pushing the values its cycle changed.
    Parent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Resolved,
    Cancelled,
}

impl Engine {
    /// Publish one value and run a propagation cycle.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cascade_core::{Connection, Engine, Registry, Value};
    ///
    /// let registry = Registry::new();
    /// let a = registry.stream::<i32>();
    /// let doubled = registry.cell(0);
    ///
    /// let engine = Engine::new(&registry);
    /// engine
    ///     .connect(Connection::new([a.id()], doubled.id(), |inputs| {
    ///         Ok(Some(Value::new(inputs.require::<i32>(0)? * 2)))
    ///     }))
    ///     .unwrap();
    ///
    /// engine.publish(a, 21).unwrap();
    /// assert_eq!(engine.get_value(doubled).unwrap(), 42);
    /// ```
    pub fn publish<T: 'static>(&self, node: NodeRef<T>, value: T) -> EngineResult<()> {
        self.publish_many(Batch::new().with(node, value))
    }

    /// Fire a trigger.
    pub fn fire(&self, trigger: NodeRef<()>) -> EngineResult<()> {
        self.publish(trigger, ())
    }

    /// Publish several values in one cycle.
    pub fn publish_many(&self, batch: Batch) -> EngineResult<()> {
        self.run_publish(batch.into_entries(), Origin::Caller)
    }

    pub(crate) fn run_publish(
        &self,
        entries: IndexMap<NodeId, Value>,
        origin: Origin,
    ) -> EngineResult<()> {
        self.ensure_live()?;
        if entries.is_empty() {
            return Ok(());
        }
        for (node, value) in &entries {
            self.registry().definition(*node)?.check_type(*node, value)?;
        }

        let parent = match origin {
            Origin::Parent => None,
            Origin::Caller | Origin::Child => self.parent(),
        };
        let mut local = IndexMap::with_capacity(entries.len());
        let mut upstream = IndexMap::new();
        for (node, value) in entries {
            let delegated = !self.owns(node)
                && parent
                    .as_ref()
                    .map(|parent| parent.owner_of(node).is_some())
                    .unwrap_or(false);
            if delegated {
                upstream.insert(node, value);
            } else {
                local.insert(node, value);
            }
        }

        if let Some(parent) = parent {
            if !upstream.is_empty() {
                parent.run_publish(upstream, Origin::Child)?;
            }
        }
        if local.is_empty() {
            return Ok(());
        }

        let changed = Propagation::run(self, local, origin)?;
        self.propagate_to_children(changed)
    }

    fn propagate_to_children(&self, changed: IndexMap<NodeId, Value>) -> EngineResult<()> {
        if changed.is_empty() {
            return Ok(());
        }
        for child in self.live_children() {
            child.run_publish(changed.clone(), Origin::Parent)?;
        }
        Ok(())
    }
}

/// Resets the streams a cycle emitted, however the cycle ends.
struct StreamReset<'e> {
    engine: &'e Engine,
    emitted: Vec<NodeId>,
}

impl Drop for StreamReset<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.engine.inner.state.try_borrow_mut() {
            for node in self.emitted.drain(..) {
                if let Some(slot) = state.streams.get_mut(&node) {
                    *slot = None;
                }
            }
        }
    }
}

/// The working state of one propagation cycle.
struct Propagation<'e> {
    engine: &'e Engine,
    plan: Rc<ExecutionPlan>,
    roots: IndexMap<NodeId, Value>,
    origin: Origin,
    scratch: HashMap<NodeId, Value>,
    ref_counts: Vec<usize>,
    slots: Vec<Slot>,
    changed: IndexMap<NodeId, Value>,
    forwarded: IndexMap<NodeId, Value>,
    reset: StreamReset<'e>,
}

impl<'e> Propagation<'e> {
    fn run(
        engine: &'e Engine,
        roots: IndexMap<NodeId, Value>,
        origin: Origin,
    ) -> EngineResult<IndexMap<NodeId, Value>> {
        let mut key: Vec<NodeId> = roots.keys().copied().collect();
        key.sort();

        let span = debug_span!("publish", engine = %engine.id(), roots = key.len());
        let _enter = span.enter();

        let plan = engine.plan_for(key)?;
        let mut cycle = Propagation {
            engine,
            ref_counts: plan.ref_counts.clone(),
            slots: vec![Slot::Pending; plan.len()],
            scratch: HashMap::with_capacity(plan.reads.len()),
            plan,
            roots,
            origin,
            changed: IndexMap::new(),
            forwarded: IndexMap::new(),
            reset: StreamReset {
                engine,
                emitted: Vec::new(),
            },
        };
        cycle.seed();

        for position in 0..cycle.plan.len() {
            if engine.is_disposed() {
                break;
            }
            if cycle.slots[position] != Slot::Pending {
                continue;
            }
            match cycle.evaluate(position)? {
                Some(value) if cycle.owned_above(position) => cycle.forward(position, value),
                Some(value) => cycle.commit(position, value)?,
                None => cycle.cancel(position),
            }
        }

        let changed = std::mem::take(&mut cycle.changed);
        let forwarded = std::mem::take(&mut cycle.forwarded);
        drop(cycle);
        if !forwarded.is_empty() {
            if let Some(parent) = engine.parent() {
                parent.run_publish(forwarded, Origin::Child)?;
            }
        }
        Ok(changed)
    }

    fn seed(&mut self) {
        for node in self.plan.reads.iter() {
            if let Some(value) = self.engine.current_value(*node) {
                self.scratch.insert(*node, value);
            }
        }
    }

    /// Decide the value of the node at `position`, if it resolves.
    fn evaluate(&self, position: usize) -> EngineResult<Option<Value>> {
        let node = self.plan.order[position];
        if let Some(value) = self.roots.get(&node) {
            // The parent already applied the distinctness rule to its roots.
            let gated = self.origin != Origin::Parent;
            return self.gate(position, None, value.clone(), gated);
        }

        let mut resolved = None;
        for projection in self.plan.feeds[position].iter() {
            if !self.any_source_resolved(&projection.sources) {
                continue;
            }
            let values: SmallVec<[Option<Value>; 6]> = projection
                .inputs
                .iter()
                .map(|input| self.scratch.get(input).cloned())
                .collect();
            let inputs = Inputs::new(node, &projection.inputs, &values);
            if let Some(value) = (projection.transform)(&inputs)? {
                if let Some(value) = self.gate(position, resolved.as_ref(), value, true)? {
                    resolved = Some(value);
                }
            }
        }
        Ok(resolved)
    }

    fn any_source_resolved(&self, sources: &[NodeId]) -> bool {
        sources.iter().any(|source| {
            self.plan
                .position(*source)
                .map(|p| self.slots[p] == Slot::Resolved)
                .unwrap_or(false)
        })
    }

    /// Type-check `value` and apply the distinctness rule against the value
    /// resolved so far this cycle, or the value from before the cycle.
    fn gate(
        &self,
        position: usize,
        candidate: Option<&Value>,
        value: Value,
        gated: bool,
    ) -> EngineResult<Option<Value>> {
        let node = self.plan.order[position];
        let info = &self.plan.nodes[position];
        if value.payload_type() != info.type_id {
            return Err(EngineError::TypeMismatch {
                node,
                expected: info.type_name,
            });
        }

        if gated {
            if let Some(comparator) = &info.comparator {
                let previous = candidate.or_else(|| self.scratch.get(&node));
                if comparator(previous, &value) {
                    if let Some(label) = &info.label {
                        debug!(%node, label = &**label, "suppressed by distinctness");
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(value))
    }

    fn commit(&mut self, position: usize, value: Value) -> EngineResult<()> {
        let node = self.plan.order[position];
        let info = &self.plan.nodes[position];
        self.slots[position] = Slot::Resolved;
        self.scratch.insert(node, value.clone());

        {
            let mut state = self.engine.state_mut();
            if state.owned.contains(&node) {
                match info.kind {
                    NodeKind::Cell => {
                        state.cells.insert(node, value.clone());
                    }
                    NodeKind::Stream | NodeKind::Trigger => {
                        state.streams.insert(node, Some(value.clone()));
                        self.reset.emitted.push(node);
                    }
                }
            }
        }
        if let Some(label) = &info.label {
            debug!(%node, label = &**label, "resolved");
        }
        self.changed.insert(node, value.clone());

        for callback in self.engine.callbacks_for(node) {
            callback(&value, self.engine)?;
        }
        Ok(())
    }

    /// Whether the node at `position` is derived here but owned by an ancestor.
    fn owned_above(&self, position: usize) -> bool {
        let node = self.plan.order[position];
        if self.roots.contains_key(&node) || self.engine.owns(node) {
            return false;
        }
        self.engine
            .parent()
            .map(|parent| parent.owner_of(node).is_some())
            .unwrap_or(false)
    }

    /// Hand a value for an ancestor-owned node to the parent. Local readers
    /// are cancelled for now and run when the parent publishes it back.
    fn forward(&mut self, position: usize, value: Value) {
        let node = self.plan.order[position];
        if let Some(label) = &self.plan.nodes[position].label {
            debug!(%node, label = &**label, "forwarded to parent");
        }
        self.forwarded.insert(node, value);
        self.cancel(position);
    }

    /// Cancel the node at `position` and everything only it could reach.
    fn cancel(&mut self, position: usize) {
        let mut stack = vec![position];
        while let Some(current) = stack.pop() {
            self.slots[current] = Slot::Cancelled;
            if let Some(label) = &self.plan.nodes[current].label {
                debug!(node = %self.plan.order[current], label = &**label, "cancelled");
            }

            for &sink in self.plan.downstream[current].iter() {
                if self.slots[sink] != Slot::Pending
                    || self.roots.contains_key(&self.plan.order[sink])
                {
                    continue;
                }
                self.ref_counts[sink] = self.ref_counts[sink].saturating_sub(1);
                if self.ref_counts[sink] == 0 {
                    self.slots[sink] = Slot::Cancelled;
                    stack.push(sink);
                }
            }
        }
    }
}
