//! Nodes
//!
//! This module defines what a node *is*, independent of any engine:
//!
//! - [`NodeRef`] / [`NodeId`]: typed and untyped tokens naming a node
//! - [`NodeKind`]: cell, stream or trigger
//! - [`Distinct`]: the rule deciding whether a new value is emitted
//! - [`Value`] / [`Batch`]: type-erased payloads and keyed sets of them
//! - [`Registry`]: the definition store that issues tokens and holds the
//!   deferred initializers
//!
//! A node's definition is created once and never changes. Its instance state
//! (current value, subscriptions, edges) lives in each engine separately.

mod distinct;
mod registry;
mod token;
mod value;

pub use distinct::Distinct;
pub use registry::{InitializerId, Registry};
pub use token::{NodeId, NodeKind, NodeRef};
pub use value::{Batch, Value};

pub(crate) use distinct::Comparator;
