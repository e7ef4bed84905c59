//! Operators
//!
//! Composition helpers built purely on [`Engine::connect`] and node
//! initializers. They add no scheduling primitives of their own.
//!
//! - engine wiring: typed helpers applied to one engine immediately
//!   (`link`, `merge`, `combine`, `change_with`, `subscribe_multiple`)
//! - deferred wiring: the same helpers declared on a [`Registry`], applied to
//!   each engine when it first touches the nodes involved
//! - pipes: operator pipelines (`map`, `filter`, `scan`, ...)
//!
//! [`Engine::connect`]: crate::Engine::connect
//! [`Registry`]: crate::Registry

mod deferred;
mod pipe;
mod tuple;
mod wiring;

pub use pipe::{Filter, Map, MapTo, Once, Operator, Pipe, Scan, WithLatestFrom};
pub use tuple::NodeTuple;
