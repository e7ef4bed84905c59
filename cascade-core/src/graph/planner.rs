//! Execution Planner
//!
//! The planner determines which nodes take part in a publish and the order in
//! which they are evaluated.
//!
//! # Algorithm
//!
//! 1. Walk downstream from the published roots along active-source edges,
//!    instantiating each node on first contact. Every arrival at a node bumps
//!    its reference count, so a node reached from two paths (a diamond) ends
//!    up with a count of two. Pull edges are recorded but never walked.
//! 2. Sort the reached nodes topologically with Kahn's algorithm. Active
//!    edges are hard constraints. Pull edges between reached nodes are soft:
//!    they put a consumer after the nodes it pulls so it reads this cycle's
//!    value, and are only relaxed when they would loop with active edges.
//! 3. Record, per node, the projections feeding it (sorted by insertion) and
//!    the downstream positions used by the cancellation cascade.
//!
//! Instantiating a node can run initializers that add projections anywhere
//! in the graph. When that happens during a walk, the walk is repeated until
//! it completes without instantiating anything new.

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use smallvec::SmallVec;

use super::Projection;
use crate::error::{EngineError, EngineResult};
use crate::node::{Comparator, NodeId, NodeKind};

/// What the planner needs from an engine.
pub(crate) trait PlanContext {
    /// Instantiate `node` if needed. Returns `true` if this call did so.
    fn register(&self, node: NodeId) -> EngineResult<bool>;

    /// Projections reading `node`, in insertion order.
    fn consumers(&self, node: NodeId) -> Vec<Rc<Projection>>;

    /// Per-node facts the scheduler needs while running the plan.
    fn describe(&self, node: NodeId) -> EngineResult<NodeInfo>;
}

/// Scheduler-facing facts about a planned node.
#[derive(Clone)]
pub(crate) struct NodeInfo {
    pub(crate) kind: NodeKind,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    /// Effective distinctness rule, including engine overrides.
    pub(crate) comparator: Option<Comparator>,
    pub(crate) label: Option<Rc<str>>,
}

/// A memoised evaluation order for one set of published roots.
pub(crate) struct ExecutionPlan {
    /// Participating nodes in evaluation order.
    pub(crate) order: Vec<NodeId>,
    /// Facts about `order[i]`.
    pub(crate) nodes: Vec<NodeInfo>,
    /// Number of active paths that can deliver a value to `order[i]`.
    pub(crate) ref_counts: Vec<usize>,
    /// Projections feeding `order[i]`, in insertion order.
    pub(crate) feeds: Vec<SmallVec<[Rc<Projection>; 2]>>,
    /// One entry per projection in which `order[i]` is an active source:
    /// the position of that projection's sink.
    pub(crate) downstream: Vec<SmallVec<[usize; 4]>>,
    /// Every node whose value the cycle may read.
    pub(crate) reads: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
}

impl ExecutionPlan {
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Position of `node` in the evaluation order.
    pub(crate) fn position(&self, node: NodeId) -> EngineResult<usize> {
        self.positions
            .get(&node)
            .copied()
            .ok_or(EngineError::NotPlanned { node })
    }
}

/// Build the plan for `roots`.
pub(crate) fn build_plan(ctx: &impl PlanContext, roots: &[NodeId]) -> EngineResult<ExecutionPlan> {
    loop {
        let walk = Walk::run(ctx, roots)?;
        if walk.instantiated {
            tracing::trace!(
                roots = roots.len(),
                "nodes instantiated while planning, walking again"
            );
            continue;
        }
        let plan = walk.into_plan(ctx)?;
        tracing::trace!(roots = roots.len(), nodes = plan.len(), "execution plan built");
        return Ok(plan);
    }
}

/// One downstream walk from the roots. Positions are discovery order.
#[derive(Default)]
struct Walk {
    discovered: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    ref_counts: Vec<usize>,
    feeds: Vec<SmallVec<[Rc<Projection>; 2]>>,
    downstream: Vec<SmallVec<[usize; 4]>>,
    /// sink -> nodes it pulls that were reached by the walk
    pull_preds: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
    instantiated: bool,
}

impl Walk {
    fn run(ctx: &impl PlanContext, roots: &[NodeId]) -> EngineResult<Self> {
        let mut walk = Walk::default();
        let mut stack: Vec<(NodeId, Option<(usize, Rc<Projection>)>)> =
            roots.iter().rev().map(|root| (*root, None)).collect();

        while let Some((node, via)) = stack.pop() {
            let (position, fresh) = match walk.index.get(&node) {
                Some(&position) => (position, false),
                None => {
                    walk.instantiated |= ctx.register(node)?;
                    (walk.discover(node), true)
                }
            };

            walk.ref_counts[position] += 1;
            if let Some((from, projection)) = via {
                walk.downstream[from].push(position);
                let feeds = &mut walk.feeds[position];
                if !feeds.iter().any(|p| p.id == projection.id) {
                    feeds.push(projection);
                }
            }

            if !fresh {
                continue;
            }
            for projection in ctx.consumers(node).into_iter().rev() {
                if projection.is_source(node) {
                    stack.push((projection.sink, Some((position, projection))));
                } else {
                    walk.pull_preds
                        .entry(projection.sink)
                        .or_default()
                        .push(node);
                }
            }
        }
        Ok(walk)
    }

    fn discover(&mut self, node: NodeId) -> usize {
        let position = self.discovered.len();
        self.discovered.push(node);
        self.index.insert(node, position);
        self.ref_counts.push(0);
        self.feeds.push(SmallVec::new());
        self.downstream.push(SmallVec::new());
        position
    }

    /// Kahn's algorithm over active edges plus relaxable pull edges, ties
    /// broken by discovery order.
    fn topological_order(&self) -> EngineResult<Vec<usize>> {
        let n = self.discovered.len();
        let mut active_in = vec![0usize; n];
        for sinks in &self.downstream {
            for &sink in sinks {
                active_in[sink] += 1;
            }
        }

        let mut pull_out: Vec<SmallVec<[usize; 2]>> = vec![SmallVec::new(); n];
        let mut pull_from: Vec<SmallVec<[usize; 2]>> = vec![SmallVec::new(); n];
        let mut pull_in = vec![0usize; n];
        for (sink, preds) in &self.pull_preds {
            let Some(&sink) = self.index.get(sink) else {
                continue;
            };
            for pred in preds {
                let Some(&pred) = self.index.get(pred) else {
                    continue;
                };
                if pred != sink && !pull_out[pred].contains(&sink) {
                    pull_out[pred].push(sink);
                    pull_from[sink].push(pred);
                    pull_in[sink] += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..n)
            .filter(|&i| active_in[i] == 0 && pull_in[i] == 0)
            .collect();
        let mut placed = vec![false; n];
        let mut sequence = Vec::with_capacity(n);

        while sequence.len() < n {
            let next = match ready.pop_first() {
                Some(next) => next,
                None => match self.loop_breaker(&placed, &active_in, &pull_from) {
                    Some(next) => next,
                    None => {
                        let stuck = (0..n).find(|&i| !placed[i]).unwrap_or(0);
                        let node = self.discovered[stuck];
                        return Err(EngineError::Cycle {
                            upstream: node,
                            sink: node,
                        });
                    }
                },
            };
            if placed[next] {
                continue;
            }
            placed[next] = true;
            sequence.push(next);

            for &sink in &self.downstream[next] {
                active_in[sink] -= 1;
                if !placed[sink] && active_in[sink] == 0 && pull_in[sink] == 0 {
                    ready.insert(sink);
                }
            }
            for &sink in &pull_out[next] {
                pull_in[sink] -= 1;
                if !placed[sink] && active_in[sink] == 0 && pull_in[sink] == 0 {
                    ready.insert(sink);
                }
            }
        }
        Ok(sequence)
    }

    /// Pick the node to release when only pull constraints remain. A pull
    /// constraint loops back through active edges, so prefer a node on that
    /// loop: one whose pending pulls are downstream of itself.
    fn loop_breaker(
        &self,
        placed: &[bool],
        active_in: &[usize],
        pull_from: &[SmallVec<[usize; 2]>],
    ) -> Option<usize> {
        let mut fallback = None;
        for i in 0..placed.len() {
            if placed[i] || active_in[i] != 0 {
                continue;
            }
            let pending: SmallVec<[usize; 2]> =
                pull_from[i].iter().copied().filter(|&p| !placed[p]).collect();
            if !pending.is_empty() && self.reaches_any(i, &pending, placed) {
                return Some(i);
            }
            fallback.get_or_insert(i);
        }
        fallback
    }

    /// Whether any of `targets` is reachable from `from` along active edges
    /// through unplaced nodes.
    fn reaches_any(&self, from: usize, targets: &[usize], placed: &[bool]) -> bool {
        let mut visited = vec![false; placed.len()];
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            for &sink in &self.downstream[current] {
                if placed[sink] || visited[sink] {
                    continue;
                }
                if targets.contains(&sink) {
                    return true;
                }
                visited[sink] = true;
                stack.push(sink);
            }
        }
        false
    }

    fn into_plan(self, ctx: &impl PlanContext) -> EngineResult<ExecutionPlan> {
        let sequence = self.topological_order()?;
        let mut remap = vec![0usize; sequence.len()];
        for (position, &discovered) in sequence.iter().enumerate() {
            remap[discovered] = position;
        }

        let mut order = Vec::with_capacity(sequence.len());
        let mut nodes = Vec::with_capacity(sequence.len());
        let mut ref_counts = Vec::with_capacity(sequence.len());
        let mut feeds = Vec::with_capacity(sequence.len());
        let mut downstream = Vec::with_capacity(sequence.len());
        let mut positions = HashMap::with_capacity(sequence.len());

        let mut reads = Vec::new();
        let mut seen = HashSet::new();

        for (position, &discovered) in sequence.iter().enumerate() {
            let node = self.discovered[discovered];
            order.push(node);
            nodes.push(ctx.describe(node)?);
            ref_counts.push(self.ref_counts[discovered]);
            positions.insert(node, position);

            let mut node_feeds = self.feeds[discovered].clone();
            node_feeds.sort_by_key(|projection| projection.id);
            for projection in &node_feeds {
                for input in projection.inputs.iter() {
                    if seen.insert(*input) {
                        reads.push(*input);
                    }
                }
            }
            feeds.push(node_feeds);

            downstream.push(
                self.downstream[discovered]
                    .iter()
                    .map(|&sink| remap[sink])
                    .collect(),
            );

            if seen.insert(node) {
                reads.push(node);
            }
        }

        Ok(ExecutionPlan {
            order,
            nodes,
            ref_counts,
            feeds,
            downstream,
            reads,
            positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Connection, Graph};
    use std::cell::RefCell;

    /// A bare graph with optional wiring that appears on instantiation.
    #[derive(Default)]
    struct MockContext {
        graph: RefCell<Graph>,
        registered: RefCell<HashSet<NodeId>>,
        on_register: RefCell<HashMap<NodeId, Vec<Connection>>>,
    }

    impl MockContext {
        fn connect(&self, sources: &[u32], pulls: &[u32], sink: u32) {
            self.graph.borrow_mut().insert(Rc::new(edge(sources, pulls, sink)));
        }
    }

    fn id(index: u32) -> NodeId {
        NodeId::new(0, index)
    }

    fn edge(sources: &[u32], pulls: &[u32], sink: u32) -> Projection {
        Connection::new(sources.iter().map(|i| id(*i)), id(sink), |_| Ok(None))
            .pulling(pulls.iter().map(|i| id(*i)))
            .into_projection()
    }

    impl PlanContext for MockContext {
        fn register(&self, node: NodeId) -> EngineResult<bool> {
            if !self.registered.borrow_mut().insert(node) {
                return Ok(false);
            }
            let wiring = self.on_register.borrow_mut().remove(&node);
            for connection in wiring.into_iter().flatten() {
                self.graph
                    .borrow_mut()
                    .insert(Rc::new(connection.into_projection()));
            }
            Ok(true)
        }

        fn consumers(&self, node: NodeId) -> Vec<Rc<Projection>> {
            self.graph.borrow().consumers(node).to_vec()
        }

        fn describe(&self, _node: NodeId) -> EngineResult<NodeInfo> {
            Ok(NodeInfo {
                kind: NodeKind::Stream,
                type_id: TypeId::of::<()>(),
                type_name: "()",
                comparator: None,
                label: None,
            })
        }
    }

    fn position_of(plan: &ExecutionPlan, index: u32) -> usize {
        plan.position(id(index)).unwrap()
    }

    #[test]
    fn diamonds_accumulate_reference_counts() {
        let ctx = MockContext::default();
        ctx.connect(&[1], &[], 2);
        ctx.connect(&[1], &[], 3);
        ctx.connect(&[2, 3], &[], 4);

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert_eq!(plan.len(), 4);

        let d = position_of(&plan, 4);
        assert_eq!(plan.ref_counts[d], 2);
        assert_eq!(plan.feeds[d].len(), 1);
        assert!(position_of(&plan, 2) < d);
        assert!(position_of(&plan, 3) < d);
        assert_eq!(plan.downstream[position_of(&plan, 1)].len(), 2);
    }

    #[test]
    fn pulls_are_ordered_before_their_consumer() {
        let ctx = MockContext::default();
        // 1 drives 5 directly, and drives 2 -> 3 -> 4 which 5 pulls.
        ctx.connect(&[1], &[4], 5);
        ctx.connect(&[1], &[], 2);
        ctx.connect(&[2], &[], 3);
        ctx.connect(&[3], &[], 4);

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert!(position_of(&plan, 4) < position_of(&plan, 5));
        assert_eq!(plan.ref_counts[position_of(&plan, 5)], 1);
    }

    #[test]
    fn pulls_do_not_drive_traversal() {
        let ctx = MockContext::default();
        ctx.connect(&[2], &[1], 3);

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert_eq!(plan.order, vec![id(1)]);
    }

    #[test]
    fn self_pulls_are_ignored_for_ordering() {
        let ctx = MockContext::default();
        ctx.connect(&[1], &[2], 2);

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert_eq!(plan.order, vec![id(1), id(2)]);
    }

    #[test]
    fn stalled_pulls_release_the_node_on_the_loop() {
        let ctx = MockContext::default();
        // 4 only pulls 3, while 2 pulls 3 and also feeds it.
        ctx.connect(&[1], &[3], 4);
        ctx.connect(&[1], &[3], 2);
        ctx.connect(&[2], &[], 3);

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert!(position_of(&plan, 2) < position_of(&plan, 3));
        assert!(position_of(&plan, 3) < position_of(&plan, 4));
    }

    #[test]
    fn wiring_added_during_instantiation_is_planned() {
        let ctx = MockContext::default();
        ctx.connect(&[1], &[], 2);
        ctx.on_register.borrow_mut().insert(
            id(2),
            vec![Connection::new([id(1)], id(3), |_| Ok(None))],
        );

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.position(id(3)).is_ok());
        assert!(ctx.registered.borrow().contains(&id(3)));
    }

    #[test]
    fn feeds_follow_insertion_order() {
        let ctx = MockContext::default();
        ctx.connect(&[2], &[], 3);
        ctx.connect(&[1], &[], 3);
        ctx.connect(&[1], &[], 2);

        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        let feeds = &plan.feeds[position_of(&plan, 3)];
        assert_eq!(feeds.len(), 2);
        assert!(feeds[0].id < feeds[1].id);
        assert_eq!(feeds[0].sources.as_slice(), &[id(2)]);
    }

    #[test]
    fn missing_nodes_are_reported() {
        let ctx = MockContext::default();
        let plan = build_plan(&ctx, &[id(1)]).unwrap();
        assert_eq!(
            plan.position(id(9)).err(),
            Some(EngineError::NotPlanned { node: id(9) })
        );
    }
}
