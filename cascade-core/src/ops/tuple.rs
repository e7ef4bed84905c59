//! Node Tuples
//!
//! Combinators that read several typed nodes at once take a tuple of tokens.
//! [`NodeTuple`] is implemented for tuples of two to four [`NodeRef`]s.

use smallvec::{smallvec, SmallVec};

use crate::error::EngineResult;
use crate::graph::Inputs;
use crate::node::{NodeId, NodeRef};

/// A tuple of typed tokens read together.
pub trait NodeTuple: Copy + 'static {
    /// One value per token, available only when every token has a value.
    type Values: Clone + 'static;

    /// One optional value per token.
    type Partial: Clone + 'static;

    /// The untyped ids, in tuple order.
    fn ids(&self) -> SmallVec<[NodeId; 4]>;

    /// Every value, or `None` if any token has none.
    fn values(&self, inputs: &Inputs<'_>) -> EngineResult<Option<Self::Values>>;

    /// Whatever values are present.
    fn partial(&self, inputs: &Inputs<'_>) -> EngineResult<Self::Partial>;
}

macro_rules! impl_node_tuple {
    ($($name:ident => $index:tt),+) => {
        impl<$($name: Clone + 'static),+> NodeTuple for ($(NodeRef<$name>,)+) {
            type Values = ($($name,)+);
            type Partial = ($(Option<$name>,)+);

            fn ids(&self) -> SmallVec<[NodeId; 4]> {
                smallvec![$(self.$index.id()),+]
            }

            fn values(&self, inputs: &Inputs<'_>) -> EngineResult<Option<Self::Values>> {
                Ok(Some(($(
                    match inputs.of(self.$index)? {
                        Some(value) => value.clone(),
                        None => return Ok(None),
                    },
                )+)))
            }

            fn partial(&self, inputs: &Inputs<'_>) -> EngineResult<Self::Partial> {
                Ok(($(inputs.of(self.$index)?.cloned(),)+))
            }
        }
    };
}

impl_node_tuple!(A => 0, B => 1);
impl_node_tuple!(A => 0, B => 1, C => 2);
impl_node_tuple!(A => 0, B => 1, C => 2, D => 3);
