//! Engine Errors
//!
//! Every fallible operation in the runtime reports an [`EngineError`]. Errors
//! raised while a propagation cycle is running abort the rest of that cycle:
//! values persisted earlier in the cycle stay persisted and subscribers that
//! already ran are not rolled back.

use thiserror::Error;

use crate::engine::EngineId;
use crate::node::NodeId;

/// Errors that can occur while wiring or driving an engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine was disposed and no longer accepts operations.
    #[error("engine {0} has been disposed")]
    Disposed(EngineId),

    /// The token was issued by a different registry than the engine's.
    #[error("{node} was issued by another registry")]
    ForeignNode { node: NodeId },

    /// The token does not name a definition in the registry.
    #[error("{node} is not defined in this registry")]
    UnknownNode { node: NodeId },

    /// A value's type differs from the type the node was declared with.
    #[error("type mismatch for {node}: expected {expected}")]
    TypeMismatch {
        node: NodeId,
        expected: &'static str,
    },

    /// The node holds no value (a stream that has not emitted this cycle).
    #[error("{node} has no value")]
    Empty { node: NodeId },

    /// The operation only applies to cells.
    #[error("{node} is not a cell")]
    NotACell { node: NodeId },

    /// Adding the projection would make `sink` transitively feed `upstream`.
    #[error("connecting {upstream} to {sink} would create a cycle")]
    Cycle { upstream: NodeId, sink: NodeId },

    /// A transform asked for an input index its projection does not have.
    #[error("input {index} is out of range for the projection into {node}")]
    MissingInput { node: NodeId, index: usize },

    /// A transform looked up a node that its projection does not read.
    #[error("{node} is not an input of the projection into {sink}")]
    NotAnInput { node: NodeId, sink: NodeId },

    /// An execution-plan lookup failed. This is an invariant violation.
    #[error("{node} is missing from the execution plan")]
    NotPlanned { node: NodeId },

    /// A user transform reported a failure.
    #[error("transform into {node} failed: {message}")]
    Transform { node: NodeId, message: String },
}

/// Result alias used throughout the crate.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_node() {
        let node = NodeId::new(0, 7);
        let err = EngineError::Empty { node };
        assert_eq!(err.to_string(), "node#7 has no value");

        let err = EngineError::Cycle {
            upstream: NodeId::new(0, 1),
            sink: NodeId::new(0, 2),
        };
        assert_eq!(
            err.to_string(),
            "connecting node#1 to node#2 would create a cycle"
        );
    }
}
