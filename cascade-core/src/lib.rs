//! Cascade Core
//!
//! This crate provides a small reactive dataflow runtime. It implements:
//!
//! - Typed nodes: stateful cells, stateless streams and valueless triggers
//! - Transform-bearing edges (projections) with active and pull inputs
//! - A memoised execution planner and a glitch-free publish scheduler
//! - Subscriptions, combinators and operator pipelines
//! - Parent/child engine hierarchies with delegated reads and writes
//!
//! Each publish runs one synchronous propagation cycle. Every node taking
//! part is evaluated at most once, after everything it depends on, and a
//! branch that fails to produce a value prunes everything downstream that has
//! no other live path.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `node`: tokens, values and the definition registry
//! - `graph`: projections, adjacency and the execution planner
//! - `engine`: instance state, the publish scheduler, subscriptions and the
//!   engine hierarchy
//! - `ops`: composition helpers and pipe operators
//! - `error`: the error type shared by all of the above
//!
//! The runtime is single-threaded. Engines and registries are `!Send`, and
//! re-entrant publishes from inside subscribers run as nested cycles.
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use cascade_core::{Connection, Engine, Registry, Value};
//!
//! let registry = Registry::new();
//! let a = registry.stream::<i32>();
//! let b = registry.stream::<i32>();
//! let c = registry.stream::<i32>();
//! let d = registry.stream::<i32>();
//!
//! let engine = Engine::new(&registry);
//! engine.connect(Connection::new([a.id()], b.id(), |i| {
//!     Ok(Some(Value::new(i.require::<i32>(0)? * 2)))
//! })).unwrap();
//! engine.connect(Connection::new([a.id()], c.id(), |i| {
//!     Ok(Some(Value::new(i.require::<i32>(0)? * 3)))
//! })).unwrap();
//! engine.connect(Connection::new([b.id(), c.id()], d.id(), |i| {
//!     Ok(Some(Value::new(i.require::<i32>(0)? + i.require::<i32>(1)?)))
//! })).unwrap();
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let seen_clone = seen.clone();
//! engine.subscribe(d, move |v: &i32, _| seen_clone.borrow_mut().push(*v)).unwrap();
//!
//! engine.publish(a, 2).unwrap();
//! // The diamond converges once.
//! assert_eq!(*seen.borrow(), vec![10]);
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod ops;

pub use engine::{
    Combined, Engine, EngineConfig, EngineId, Subscription, SubscriptionId, WeakEngine,
};
pub use error::{EngineError, EngineResult};
pub use graph::{Connection, Inputs, ProjectionId, TransformResult};
pub use node::{Batch, Distinct, InitializerId, NodeId, NodeKind, NodeRef, Registry, Value};
pub use ops::{NodeTuple, Operator, Pipe};
