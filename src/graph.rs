//! Deterministic ordering over `petgraph` graphs.
//!
//! Both the phase graph and the step graph are linearised here. The sort is
//! Kahn's algorithm where the ready set is a min-heap of node indices, so among
//! nodes with no ordering constraint between them the one inserted first always
//! comes first. Identical input therefore always gives identical output.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

/// Sorts `graph` topologically, breaking ties by lowest node index.
///
/// On failure returns one cycle as an ordered list of nodes, where each node
/// has an edge to the next one and the first node is repeated at the end.
pub(crate) fn toposort_stable<N, E>(graph: &DiGraph<N, E>) -> Result<Vec<NodeIndex>, Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|index| graph.edges_directed(index, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(Reverse(index)) = ready.pop() {
        let node = NodeIndex::new(index);
        order.push(node);

        for edge in graph.edges_directed(node, Direction::Outgoing) {
            let target = edge.target().index();
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                ready.push(Reverse(target));
            }
        }
    }

    if order.len() == graph.node_count() {
        Ok(order)
    } else {
        Err(find_cycle(graph, &in_degree))
    }
}

/// Walks predecessors among the nodes Kahn's algorithm could not release.
///
/// Every such node still has a predecessor that was not released either, so
/// the walk has to revisit a node eventually, and the revisited stretch is a
/// cycle.
fn find_cycle<N, E>(graph: &DiGraph<N, E>, in_degree: &[usize]) -> Vec<NodeIndex> {
    let stuck = |index: NodeIndex| in_degree[index.index()] > 0;

    let Some(start) = graph.node_indices().find(|&index| stuck(index)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position = vec![None; graph.node_count()];
    position[start.index()] = Some(0);

    loop {
        let current = path[path.len() - 1];
        let previous = graph
            .neighbors_directed(current, Direction::Incoming)
            .filter(|&index| stuck(index))
            .min();

        let Some(previous) = previous else {
            // only possible when the sort did not fail
            return path;
        };

        if let Some(at) = position[previous.index()] {
            let mut cycle: Vec<NodeIndex> = path[at..].iter().rev().copied().collect();
            cycle.push(cycle[0]);
            return cycle;
        }

        position[previous.index()] = Some(path.len());
        path.push(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(graph: &DiGraph<&'static str, ()>, order: &[NodeIndex]) -> Vec<&'static str> {
        order.iter().map(|&index| graph[index]).collect()
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut graph = DiGraph::new();
        graph.add_node("c");
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        graph.add_edge(a, b, ());

        let order = toposort_stable(&graph).unwrap();
        assert_eq!(names(&graph, &order), vec!["c", "a", "b"]);
    }

    #[test]
    fn edges_win_over_insertion_order() {
        let mut graph = DiGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_edge(c, a, ());
        graph.add_edge(b, a, ());

        let order = toposort_stable(&graph).unwrap();
        assert_eq!(names(&graph, &order), vec!["b", "c", "a"]);
    }

    #[test]
    fn reports_cycle_in_edge_order() {
        let mut graph = DiGraph::new();
        let x = graph.add_node("x");
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_edge(x, a, ());
        graph.add_edge(a, b, ());
        graph.add_edge(b, c, ());
        graph.add_edge(c, a, ());

        let cycle = toposort_stable(&graph).unwrap_err();
        let cycle = names(&graph, &cycle);

        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(!cycle.contains(&"x"));

        // every hop is a real edge
        let indices: Vec<_> = cycle
            .iter()
            .map(|name| graph.node_indices().find(|&i| graph[i] == *name).unwrap())
            .collect();
        for pair in indices.windows(2) {
            assert!(graph.find_edge(pair[0], pair[1]).is_some());
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut graph = DiGraph::new();
        let a = graph.add_node("a");
        graph.add_edge(a, a, ());

        let cycle = toposort_stable(&graph).unwrap_err();
        assert_eq!(names(&graph, &cycle), vec!["a", "a"]);
    }

    #[test]
    fn empty_graph() {
        let graph: DiGraph<&'static str, ()> = DiGraph::new();
        assert!(toposort_stable(&graph).unwrap().is_empty());
    }
}
