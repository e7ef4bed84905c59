//! Projections
//!
//! A projection is a transform-bearing edge. It reads the current values of
//! its *active sources* and its *pulls* and may produce a value for its sink.
//! Only active sources drive evaluation: a projection runs in a cycle because
//! one of its active sources resolved, never because a pulled node did.

use std::any;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::error::{EngineError, EngineResult};
use crate::node::{NodeId, NodeRef, Value};

/// What a transform produces: `Ok(Some(value))` resolves the sink,
/// `Ok(None)` leaves it unresolved for this cycle, and `Err` aborts the cycle.
pub type TransformResult = EngineResult<Option<Value>>;

pub(crate) type Transform = Rc<dyn Fn(&Inputs<'_>) -> TransformResult>;

/// Identifier of a projection. Ids grow with insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectionId(u64);

impl ProjectionId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An edge from a set of active sources (plus pulls) to a sink.
pub(crate) struct Projection {
    pub(crate) id: ProjectionId,
    pub(crate) sources: SmallVec<[NodeId; 4]>,
    pub(crate) pulls: SmallVec<[NodeId; 2]>,
    pub(crate) sink: NodeId,
    /// `sources` followed by `pulls`, in the order the transform sees them.
    pub(crate) inputs: SmallVec<[NodeId; 6]>,
    pub(crate) transform: Transform,
}

impl Projection {
    fn new(
        sources: SmallVec<[NodeId; 4]>,
        pulls: SmallVec<[NodeId; 2]>,
        sink: NodeId,
        transform: Transform,
    ) -> Self {
        let inputs = sources.iter().chain(pulls.iter()).copied().collect();
        Self {
            id: ProjectionId::new(),
            sources,
            pulls,
            sink,
            inputs,
            transform,
        }
    }

    /// Whether `node` drives this projection.
    pub(crate) fn is_source(&self, node: NodeId) -> bool {
        self.sources.contains(&node)
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("id", &self.id)
            .field("sources", &self.sources)
            .field("pulls", &self.pulls)
            .field("sink", &self.sink)
            .finish()
    }
}

/// A projection waiting to be added with [`Engine::connect`].
///
/// [`Engine::connect`]: crate::Engine::connect
///
/// # Example
///
/// ```rust
/// use cascade_core::{Connection, Engine, Registry, Value};
///
/// let registry = Registry::new();
/// let a = registry.stream::<i32>();
/// let b = registry.stream::<i32>();
///
/// let engine = Engine::new(&registry);
/// engine
///     .connect(Connection::new([a.id()], b.id(), |inputs| {
///         let n = inputs.require::<i32>(0)?;
///         Ok((n % 2 == 0).then(|| Value::new(n * 10)))
///     }))
///     .unwrap();
/// ```
pub struct Connection {
    pub(crate) sources: SmallVec<[NodeId; 4]>,
    pub(crate) pulls: SmallVec<[NodeId; 2]>,
    pub(crate) sink: NodeId,
    pub(crate) transform: Transform,
}

impl Connection {
    /// Describe a projection from `sources` into `sink`.
    ///
    /// Duplicate sources are dropped; the first occurrence keeps its position.
    pub fn new(
        sources: impl IntoIterator<Item = NodeId>,
        sink: NodeId,
        transform: impl Fn(&Inputs<'_>) -> TransformResult + 'static,
    ) -> Self {
        Self {
            sources: dedup(sources),
            pulls: SmallVec::new(),
            sink,
            transform: Rc::new(transform),
        }
    }

    /// Add nodes the transform reads without being driven by them.
    pub fn pulling(mut self, pulls: impl IntoIterator<Item = NodeId>) -> Self {
        for pull in pulls {
            if !self.pulls.contains(&pull) {
                self.pulls.push(pull);
            }
        }
        self
    }

    pub(crate) fn into_projection(self) -> Projection {
        Projection::new(self.sources, self.pulls, self.sink, self.transform)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("sources", &self.sources)
            .field("pulls", &self.pulls)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

fn dedup<A: smallvec::Array<Item = NodeId>>(ids: impl IntoIterator<Item = NodeId>) -> SmallVec<A> {
    let mut out = SmallVec::new();
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// The values a transform reads: active sources first, then pulls.
///
/// A slot is `None` when the node has no value this cycle (a stream that did
/// not emit).
pub struct Inputs<'a> {
    sink: NodeId,
    ids: &'a [NodeId],
    values: &'a [Option<Value>],
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(sink: NodeId, ids: &'a [NodeId], values: &'a [Option<Value>]) -> Self {
        debug_assert_eq!(ids.len(), values.len());
        Self { sink, ids, values }
    }

    /// The node this projection writes to.
    pub fn sink(&self) -> NodeId {
        self.sink
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The node feeding slot `index`.
    pub fn node(&self, index: usize) -> EngineResult<NodeId> {
        self.ids.get(index).copied().ok_or(EngineError::MissingInput {
            node: self.sink,
            index,
        })
    }

    /// The untyped value in slot `index`.
    pub fn value(&self, index: usize) -> EngineResult<Option<&'a Value>> {
        self.values
            .get(index)
            .map(Option::as_ref)
            .ok_or(EngineError::MissingInput {
                node: self.sink,
                index,
            })
    }

    /// All slots in order.
    pub fn values(&self) -> &'a [Option<Value>] {
        self.values
    }

    /// The value in slot `index` as `T`, or `None` if the node has no value.
    pub fn get<T: 'static>(&self, index: usize) -> EngineResult<Option<&'a T>> {
        match self.value(index)? {
            None => Ok(None),
            Some(value) => value
                .downcast_ref::<T>()
                .map(Some)
                .ok_or(EngineError::TypeMismatch {
                    node: self.ids[index],
                    expected: any::type_name::<T>(),
                }),
        }
    }

    /// The value of `node` as `T`, found by identity rather than by slot.
    pub fn of<T: 'static>(&self, node: NodeRef<T>) -> EngineResult<Option<&'a T>> {
        let index = self
            .ids
            .iter()
            .position(|id| *id == node.id())
            .ok_or(EngineError::NotAnInput {
                node: node.id(),
                sink: self.sink,
            })?;
        self.get::<T>(index)
    }

    /// The value in slot `index` as `T`; a node without a value is an error.
    pub fn require<T: 'static>(&self, index: usize) -> EngineResult<&'a T> {
        self.get::<T>(index)?.ok_or(EngineError::Empty {
            node: self.ids[index],
        })
    }
}

impl fmt::Debug for Inputs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inputs")
            .field("sink", &self.sink)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u32) -> NodeId {
        NodeId::new(0, index)
    }

    #[test]
    fn connection_dedups_sources_and_pulls() {
        let connection = Connection::new([id(1), id(2), id(1)], id(9), |_| Ok(None))
            .pulling([id(3), id(3)]);
        let projection = connection.into_projection();

        assert_eq!(projection.sources.as_slice(), &[id(1), id(2)]);
        assert_eq!(projection.pulls.as_slice(), &[id(3)]);
        assert_eq!(projection.inputs.as_slice(), &[id(1), id(2), id(3)]);
        assert!(projection.is_source(id(2)));
        assert!(!projection.is_source(id(3)));
    }

    #[test]
    fn projection_ids_follow_insertion_order() {
        let first = Connection::new([id(1)], id(2), |_| Ok(None)).into_projection();
        let second = Connection::new([id(1)], id(2), |_| Ok(None)).into_projection();
        assert!(first.id < second.id);
    }

    #[test]
    fn inputs_are_typed_on_access() {
        let ids = [id(1), id(2)];
        let values = [Some(Value::new(4i64)), None];
        let inputs = Inputs::new(id(5), &ids, &values);

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.require::<i64>(0), Ok(&4));
        assert_eq!(inputs.get::<i64>(1), Ok(None));
        assert_eq!(inputs.require::<i64>(1), Err(EngineError::Empty { node: id(2) }));
        assert!(matches!(
            inputs.get::<u8>(0),
            Err(EngineError::TypeMismatch { .. })
        ));
        assert_eq!(
            inputs.value(2).err(),
            Some(EngineError::MissingInput { node: id(5), index: 2 })
        );
    }

    #[test]
    fn inputs_can_be_read_by_token() {
        let ids = [id(1), id(2)];
        let values = [Some(Value::new(1u8)), Some(Value::new(2u8))];
        let inputs = Inputs::new(id(5), &ids, &values);

        assert_eq!(inputs.of(NodeRef::<u8>::from_id(id(2))), Ok(Some(&2)));
        assert_eq!(
            inputs.of(NodeRef::<u8>::from_id(id(3))).err(),
            Some(EngineError::NotAnInput {
                node: id(3),
                sink: id(5)
            })
        );
    }
}
