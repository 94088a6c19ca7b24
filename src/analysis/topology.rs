use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashSet, VecDeque};

/// Result of a DFS topological sort over a dependency graph.
#[derive(Debug, Clone, Default)]
pub struct TopoOrder {
    /// Every node, dependencies before consumers. Back edges are ignored.
    pub order: Vec<NodeIndex>,
    /// Nodes that closed a cycle during the DFS (targets of back edges).
    pub back_edges: Vec<(NodeIndex, NodeIndex)>,
}

impl TopoOrder {
    pub fn is_acyclic(&self) -> bool { self.back_edges.is_empty() }
}

/// Topological sort using Depth-First Search.
///
/// Edges point consumer -> dependency (`A -> B` when A references B), so the
/// DFS post-order places every dependency before the node that uses it.
/// Roots are visited in index order, which keeps the result deterministic.
pub fn sort<N, E>(graph: &DiGraph<N, E>) -> TopoOrder {
    let count = graph.node_count();
    let mut result = TopoOrder { order: Vec::with_capacity(count), back_edges: Vec::new() };
    let mut state = vec![VisitState::None; count];

    for idx in graph.node_indices() {
        if state[idx.index()] == VisitState::None {
            visit(idx, graph, &mut state, &mut result);
        }
    }

    result
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    None,
    Visiting, // on the current DFS stack
    Visited,
}

fn visit<N, E>(node: NodeIndex, graph: &DiGraph<N, E>, state: &mut [VisitState], out: &mut TopoOrder) {
    state[node.index()] = VisitState::Visiting;

    // petgraph yields neighbors most-recent-first; sort for stable output.
    let mut deps: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    deps.sort();
    deps.dedup();

    for dep in deps {
        match state[dep.index()] {
            VisitState::Visited => {}
            VisitState::Visiting => out.back_edges.push((node, dep)),
            VisitState::None => visit(dep, graph, state, out),
        }
    }

    state[node.index()] = VisitState::Visited;
    out.order.push(node);
}

/// Strongly connected components that form cycles: more than one member, or
/// a single member that references itself.
pub fn cyclic_components<N, E>(graph: &DiGraph<N, E>) -> Vec<Vec<NodeIndex>> {
    tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort();
            scc
        })
        .collect()
}

/// A closed walk through every member of a cyclic component, starting and
/// ending at its first member, e.g. `[A, B, A]` for `A <-> B`.
pub fn cycle_walk<N, E>(graph: &DiGraph<N, E>, component: &[NodeIndex]) -> Vec<NodeIndex> {
    let Some(&start) = component.first() else { return Vec::new() };
    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let mut walk = vec![start];
    let mut pending: Vec<NodeIndex> = component[1..].to_vec();
    let mut current = start;

    while !pending.is_empty() {
        let Some(path) = shortest_path(graph, &members, current, |n| pending.contains(&n)) else { break };
        let reached = path[path.len() - 1];
        pending.retain(|&n| !path.contains(&n));
        walk.extend_from_slice(&path[1..]);
        current = reached;
    }

    match shortest_path(graph, &members, current, |n| n == start) {
        Some(path) if current != start || graph.contains_edge(start, start) => walk.extend_from_slice(&path[1..]),
        Some(_) | None => {}
    }
    if walk.len() == 1 {
        walk.push(start);
    }
    walk
}

// BFS inside `members` from `from` to the first node satisfying `goal`,
// taking at least one step.
fn shortest_path<N, E>(
    graph: &DiGraph<N, E>,
    members: &HashSet<NodeIndex>,
    from: NodeIndex,
    goal: impl Fn(NodeIndex) -> bool,
) -> Option<Vec<NodeIndex>> {
    let mut prev: Vec<Option<NodeIndex>> = vec![None; graph.node_count()];
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);

    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.sort();
        for n in next {
            if !members.contains(&n) || !seen.insert(n) {
                continue;
            }
            prev[n.index()] = Some(node);
            if goal(n) {
                let mut path = vec![n];
                let mut cur = node;
                while cur != from {
                    path.push(cur);
                    cur = prev[cur.index()]?;
                }
                path.push(from);
                path.reverse();
                return Some(path);
            }
            queue.push_back(n);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn graph(n: usize, edges: &[(usize, usize)]) -> DiGraph<usize, ()> {
        let mut g = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..n).map(|i| g.add_node(i)).collect();
        for &(a, b) in edges {
            g.add_edge(nodes[a], nodes[b], ());
        }
        g
    }

    #[test]
    fn test_sort_diamond_dependency() {
        // D uses B and C, both use A.
        let g = graph(4, &[(3, 1), (3, 2), (1, 0), (2, 0)]);
        let res = sort(&g);
        let pos = |i: usize| res.order.iter().position(|n| n.index() == i).unwrap();
        assert!(res.is_acyclic());
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(3));
    }

    #[test]
    fn test_two_node_cycle_walk() {
        let g = graph(2, &[(0, 1), (1, 0)]);
        assert!(!sort(&g).is_acyclic());
        let comps = cyclic_components(&g);
        assert_eq!(comps.len(), 1);
        let walk: Vec<usize> = cycle_walk(&g, &comps[0]).iter().map(|n| n.index()).collect();
        assert_eq!(walk, vec![0, 1, 0]);
    }

    #[test]
    fn test_cycle_walk_names_every_member() {
        // 0 -> 1 -> 2 -> 0 plus a chord 1 -> 0, and 3 -> 0 outside the cycle.
        let g = graph(4, &[(0, 1), (1, 2), (2, 0), (1, 0), (3, 0)]);
        let comps = cyclic_components(&g);
        assert_eq!(comps.len(), 1);
        let walk: Vec<usize> = cycle_walk(&g, &comps[0]).iter().map(|n| n.index()).collect();
        assert_eq!(walk.first(), walk.last());
        for member in 0..3 {
            assert!(walk.contains(&member));
        }
        assert!(!walk.contains(&3));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let g = graph(2, &[(0, 0), (1, 0)]);
        let comps = cyclic_components(&g);
        assert_eq!(comps, vec![vec![NodeIndex::new(0)]]);
        let walk: Vec<usize> = cycle_walk(&g, &comps[0]).iter().map(|n| n.index()).collect();
        assert_eq!(walk, vec![0, 0]);
    }

    proptest! {
        // Edges only go from higher to lower index, so the graph is a DAG.
        #[test]
        fn prop_order_respects_every_edge(n in 1usize..24, raw in proptest::collection::vec((0usize..24, 0usize..24), 0..80)) {
            let edges: Vec<(usize, usize)> = raw
                .into_iter()
                .map(|(a, b)| (a % n, b % n))
                .filter(|(a, b)| a > b)
                .collect();
            let g = graph(n, &edges);
            let res = sort(&g);
            prop_assert!(res.is_acyclic());
            prop_assert_eq!(res.order.len(), n);
            let pos = |i: usize| res.order.iter().position(|x| x.index() == i).unwrap();
            for (a, b) in edges {
                prop_assert!(pos(b) < pos(a));
            }
        }
    }
}
