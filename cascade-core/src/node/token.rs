//! Node Tokens
//!
//! A token is an opaque handle naming a node. It carries no state of its own:
//! the node's definition lives in the [`Registry`](super::Registry) that issued
//! it, and its instance state lives in each engine that has touched it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Untyped identifier for a node.
///
/// The identifier records the registry that issued it and the node's index in
/// that registry's definition arena. Identifiers are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    registry: u32,
    index: u32,
}

impl NodeId {
    pub(crate) fn new(registry: u32, index: u32) -> Self {
        Self { registry, index }
    }

    /// The id of the registry that issued this node.
    pub(crate) fn registry(&self) -> u32 {
        self.registry
    }

    /// The node's position in its registry's definition arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.index)
    }
}

/// The kind of node a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A stateful node. Once instantiated in an engine it always holds a
    /// value, and that value persists across cycles.
    Cell,

    /// A stateless node. It holds a value only during the cycle in which it
    /// was resolved.
    Stream,

    /// A stream without a payload that fires on every publish.
    Trigger,
}

impl NodeKind {
    /// Whether values of this kind persist between cycles.
    pub fn is_stateful(self) -> bool {
        self == NodeKind::Cell
    }
}

/// A typed token for a node carrying values of type `T`.
///
/// Tokens are `Copy`; passing one around never clones any state.
pub struct NodeRef<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NodeRef<T> {
    pub(crate) fn from_id(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The untyped identifier of this node.
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<T> {}

impl<T> PartialEq for NodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for NodeRef<T> {}

impl<T> Hash for NodeRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.id).finish()
    }
}

impl<T> From<NodeRef<T>> for NodeId {
    fn from(node: NodeRef<T>) -> Self {
        node.id
    }
}

impl<T> From<&NodeRef<T>> for NodeId {
    fn from(node: &NodeRef<T>) -> Self {
        node.id
    }
}
