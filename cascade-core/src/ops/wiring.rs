//! Engine Wiring Helpers
//!
//! Typed shorthands for common projections, applied to one engine right
//! away. Each one is a plain [`Engine::connect`] call.

use std::rc::Rc;

use super::NodeTuple;
use crate::engine::{Engine, Subscription};
use crate::error::EngineResult;
use crate::graph::{Connection, Inputs, ProjectionId, TransformResult};
use crate::node::{NodeKind, NodeRef, Value};

/// Pass the first input through unchanged.
pub(crate) fn forward(inputs: &Inputs<'_>) -> TransformResult {
    Ok(inputs.value(0)?.cloned())
}

impl Engine {
    /// Resolve `sink` with every value `source` resolves to.
    pub fn link<T: 'static>(&self, source: NodeRef<T>, sink: NodeRef<T>) -> EngineResult<ProjectionId> {
        self.connect(Connection::new([source.id()], sink.id(), forward))
    }

    /// A new stream emitting whatever any of `sources` emits.
    ///
    /// When several sources resolve in one cycle, the one linked last wins.
    pub fn merge<T: 'static>(&self, sources: &[NodeRef<T>]) -> EngineResult<NodeRef<T>> {
        let out = self.registry().stream::<T>();
        self.merge_into(sources, out)?;
        Ok(out)
    }

    pub(crate) fn merge_into<T: 'static>(
        &self,
        sources: &[NodeRef<T>],
        out: NodeRef<T>,
    ) -> EngineResult<()> {
        for source in sources {
            self.link(*source, out)?;
        }
        Ok(())
    }

    /// A node holding the values of every node in `nodes`.
    ///
    /// The result is a cell, seeded right away, when every source is a cell,
    /// and a stream otherwise.
    pub fn combine<N: NodeTuple>(&self, nodes: N) -> EngineResult<NodeRef<N::Values>> {
        let registry = self.registry();
        let all_cells = nodes
            .ids()
            .iter()
            .map(|id| registry.kind(*id))
            .collect::<EngineResult<Vec<_>>>()?
            .into_iter()
            .all(|kind| kind == NodeKind::Cell);
        let out = if all_cells {
            registry.derived_cell::<N::Values>()
        } else {
            registry.stream::<N::Values>()
        };
        self.combine_into(nodes, out)?;
        Ok(out)
    }

    pub(crate) fn combine_into<N: NodeTuple>(
        &self,
        nodes: N,
        out: NodeRef<N::Values>,
    ) -> EngineResult<()> {
        let ids = nodes.ids();
        self.connect(Connection::new(ids.iter().copied(), out.id(), move |inputs| {
            Ok(nodes.values(inputs)?.map(Value::new))
        }))?;

        if self.registry().kind(out.id())? == NodeKind::Cell {
            let current: Vec<Option<Value>> =
                ids.iter().map(|id| self.current_value(*id)).collect();
            let inputs = Inputs::new(out.id(), &ids, &current);
            if let Some(values) = nodes.values(&inputs)? {
                self.overwrite(out.id(), Value::new(values))?;
            }
        }
        Ok(())
    }

    /// Fold every value of `source` into `cell` with `reducer`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cascade_core::{Engine, Registry};
    ///
    /// let registry = Registry::new();
    /// let total = registry.cell(0);
    /// let added = registry.stream::<i32>();
    /// let engine = Engine::new(&registry);
    ///
    /// engine.change_with(total, added, |total, n| total + n).unwrap();
    /// engine.publish(added, 2).unwrap();
    /// engine.publish(added, 3).unwrap();
    /// assert_eq!(engine.get_value(total).unwrap(), 5);
    /// ```
    pub fn change_with<T: 'static, U: 'static>(
        &self,
        cell: NodeRef<T>,
        source: NodeRef<U>,
        reducer: impl Fn(&T, &U) -> T + 'static,
    ) -> EngineResult<ProjectionId> {
        self.change_with_shared(cell, source, Rc::new(reducer))
    }

    pub(crate) fn change_with_shared<T: 'static, U: 'static>(
        &self,
        cell: NodeRef<T>,
        source: NodeRef<U>,
        reducer: Rc<dyn Fn(&T, &U) -> T>,
    ) -> EngineResult<ProjectionId> {
        self.connect(
            Connection::new([source.id()], cell.id(), move |inputs| {
                let next = inputs.require::<U>(0)?;
                let current = inputs.require::<T>(1)?;
                Ok(Some(Value::new(reducer(current, next))))
            })
            .pulling([cell.id()]),
        )
    }

    /// Call `callback` with the current values of all `nodes` whenever any
    /// of them resolves, at most once per cycle.
    pub fn subscribe_multiple<N: NodeTuple>(
        &self,
        nodes: N,
        callback: impl Fn(&N::Partial, &Engine) + 'static,
    ) -> EngineResult<Subscription> {
        let hidden = self.registry().stream::<N::Partial>();
        self.connect(Connection::new(nodes.ids(), hidden.id(), move |inputs| {
            Ok(Some(Value::new(nodes.partial(inputs)?)))
        }))?;
        self.subscribe(hidden, callback)
    }
}
