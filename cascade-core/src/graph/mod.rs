//! Dependency Graph
//!
//! This module holds the per-engine graph of projections and the planner that
//! turns a set of published nodes into an execution plan.
//!
//! # Overview
//!
//! - Nodes are identified by [`NodeId`]; the graph stores no node state.
//! - Edges are [`Projection`]s. Each projection is indexed under every node
//!   it reads (active sources and pulls), in insertion order, so the planner
//!   can walk downstream from any node.
//!
//! # Design Decisions
//!
//! 1. Only active-source edges may form cycles, and `connect` rejects a
//!    projection that would close one. Pull edges are exempt: a cell that
//!    pulls its own previous value (a reducer) is a common and valid shape.
//!
//! 2. Per-node projection lists are ordered by insertion. When several
//!    projections resolve the same sink in one cycle, the last one in
//!    insertion order wins.
//!
//! 3. Any structural change throws away every cached plan. The graph is
//!    expected to settle early and be published to many times afterwards.

mod planner;
mod projection;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub(crate) use planner::{build_plan, ExecutionPlan, NodeInfo, PlanContext};
pub(crate) use projection::Projection;
pub use projection::{Connection, Inputs, ProjectionId, TransformResult};

use crate::node::NodeId;

/// Adjacency from a node to the projections that read it.
#[derive(Default)]
pub(crate) struct Graph {
    consumers: HashMap<NodeId, Vec<Rc<Projection>>>,
    projection_count: usize,
}

impl Graph {
    /// Index `projection` under each node it reads.
    pub(crate) fn insert(&mut self, projection: Rc<Projection>) {
        let mut seen = HashSet::new();
        for node in projection.inputs.iter() {
            if seen.insert(*node) {
                self.consumers
                    .entry(*node)
                    .or_default()
                    .push(Rc::clone(&projection));
            }
        }
        self.projection_count += 1;
    }

    /// Projections reading `node`, in insertion order.
    pub(crate) fn consumers(&self, node: NodeId) -> &[Rc<Projection>] {
        self.consumers.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of projections in the graph.
    pub(crate) fn len(&self) -> usize {
        self.projection_count
    }

    /// Check whether a projection `sources -> sink` would close a cycle of
    /// active edges. Returns the source that `sink` already reaches.
    pub(crate) fn would_cycle(&self, sources: &[NodeId], sink: NodeId) -> Option<NodeId> {
        if sources.contains(&sink) {
            return Some(sink);
        }

        let mut visited = HashSet::new();
        let mut stack = vec![sink];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            for projection in self.consumers(node) {
                if !projection.is_source(node) {
                    continue;
                }
                if sources.contains(&projection.sink) {
                    return Some(projection.sink);
                }
                stack.push(projection.sink);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u32) -> NodeId {
        NodeId::new(0, index)
    }

    fn edge(sources: &[u32], pulls: &[u32], sink: u32) -> Rc<Projection> {
        Rc::new(
            Connection::new(sources.iter().map(|i| id(*i)), id(sink), |_| Ok(None))
                .pulling(pulls.iter().map(|i| id(*i)))
                .into_projection(),
        )
    }

    #[test]
    fn projections_are_indexed_under_sources_and_pulls() {
        let mut graph = Graph::default();
        graph.insert(edge(&[1], &[2], 3));
        graph.insert(edge(&[1], &[], 4));

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.consumers(id(1)).len(), 2);
        assert_eq!(graph.consumers(id(2)).len(), 1);
        assert!(graph.consumers(id(3)).is_empty());

        let sinks: Vec<NodeId> = graph.consumers(id(1)).iter().map(|p| p.sink).collect();
        assert_eq!(sinks, vec![id(3), id(4)]);
    }

    #[test]
    fn active_cycles_are_detected() {
        let mut graph = Graph::default();
        graph.insert(edge(&[1], &[], 2));
        graph.insert(edge(&[2], &[], 3));

        assert_eq!(graph.would_cycle(&[id(3)], id(1)), Some(id(3)));
        assert_eq!(graph.would_cycle(&[id(4)], id(4)), Some(id(4)));
        assert_eq!(graph.would_cycle(&[id(1)], id(3)), None);
    }

    #[test]
    fn pull_edges_never_count_as_cycles() {
        let mut graph = Graph::default();
        // 2 pulls itself, and 1 drives 2.
        graph.insert(edge(&[1], &[2], 2));
        // 3 pulls 2 while driving nothing upstream.
        graph.insert(edge(&[4], &[2], 3));

        assert_eq!(graph.would_cycle(&[id(2)], id(4)), None);
    }
}
