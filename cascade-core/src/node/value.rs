//! Type-Erased Values
//!
//! Nodes of many different types flow through one scheduler, so the engine
//! stores and passes values as [`Value`]: a reference-counted `dyn Any`.
//! Typed tokens guarantee that a node only ever sees values of its declared
//! type; every boundary where an untyped value enters the engine is checked.

use std::any::{self, Any, TypeId};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::{NodeId, NodeRef};
use crate::error::{EngineError, EngineResult};

/// A reference-counted, type-erased node value.
///
/// Cloning a `Value` only bumps a reference count.
#[derive(Clone)]
pub struct Value(Rc<dyn Any>);

impl Value {
    /// Wrap a value.
    pub fn new<T: 'static>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Borrow the payload as `T`, if it has that type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether the payload has type `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Whether both values share the same allocation.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The `TypeId` of the payload (not of the `Rc`).
    pub(crate) fn payload_type(&self) -> TypeId {
        Any::type_id(&*self.0)
    }

    /// Clone the payload out as `T`, reporting a mismatch against `node`.
    pub(crate) fn read<T: Clone + 'static>(&self, node: NodeId) -> EngineResult<T> {
        self.downcast_ref::<T>()
            .cloned()
            .ok_or(EngineError::TypeMismatch {
                node,
                expected: any::type_name::<T>(),
            })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Value(..)")
    }
}

/// A set of values keyed by node, published together in one cycle.
///
/// Also used to seed an engine's initial state. When the same node is inserted
/// twice, the later value replaces the earlier one.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    entries: IndexMap<NodeId, Value>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with<T: 'static>(mut self, node: NodeRef<T>, value: T) -> Self {
        self.insert(node, value);
        self
    }

    /// Add a typed value for `node`.
    pub fn insert<T: 'static>(&mut self, node: NodeRef<T>, value: T) {
        self.entries.insert(node.id(), Value::new(value));
    }

    /// Add an untyped value. Its type is checked when the batch is applied.
    pub fn insert_value(&mut self, node: NodeId, value: Value) {
        self.entries.insert(node, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Value)> + '_ {
        self.entries.iter().map(|(id, value)| (*id, value))
    }

    pub(crate) fn into_entries(self) -> IndexMap<NodeId, Value> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_type_ignores_the_rc() {
        let value = Value::new(5u8);
        assert_eq!(value.payload_type(), TypeId::of::<u8>());
        assert!(value.is::<u8>());
        assert!(!value.is::<u16>());
    }

    #[test]
    fn read_reports_the_expected_type() {
        let node = NodeId::new(0, 3);
        let value = Value::new("text");
        assert_eq!(value.read::<&str>(node), Ok("text"));
        assert_eq!(
            value.read::<u32>(node),
            Err(EngineError::TypeMismatch {
                node,
                expected: "u32"
            })
        );
    }

    #[test]
    fn clones_share_the_payload() {
        let a = Value::new(vec![1, 2, 3]);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Value::new(vec![1, 2, 3])));
    }

    #[test]
    fn batch_keeps_the_last_value_per_node() {
        let node: NodeRef<i32> = NodeRef::from_id(NodeId::new(0, 1));
        let other: NodeRef<i32> = NodeRef::from_id(NodeId::new(0, 2));
        let batch = Batch::new().with(node, 1).with(other, 2).with(node, 3);

        assert_eq!(batch.len(), 2);
        let values: Vec<i32> = batch
            .iter()
            .map(|(_, v)| *v.downcast_ref::<i32>().unwrap())
            .collect();
        assert_eq!(values, vec![3, 2]);
    }
}
