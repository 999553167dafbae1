//! Stable topological ordering with full cycle reporting.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

/// Orders nodes `0..node_count` so that for every `(before, after)` edge,
/// `before` comes first. Among nodes that are ready at the same time the
/// lowest index wins, so the order follows declaration order wherever the
/// dependencies allow.
///
/// On a cycle returns the node indices along one loop, first node repeated
/// at the end (`[a, b, c, a]` when `a` must come after `b`, `b` after `c`
/// and `c` after `a`).
pub fn topological_order(
    node_count: usize,
    edges: &[(usize, usize)],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(node_count, edges.len());
    for i in 0..node_count {
        graph.add_node(i);
    }
    for &(before, after) in edges {
        graph.update_edge(NodeIndex::new(before), NodeIndex::new(after), ());
    }

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(node_count);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for next in graph.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
            let n = next.index();
            in_degree[n] -= 1;
            if in_degree[n] == 0 {
                ready.push(Reverse(n));
            }
        }
    }

    if order.len() == node_count {
        Ok(order)
    } else {
        Err(find_cycle(&graph, &in_degree))
    }
}

/// Walks backwards from a node that never became ready until a node repeats.
/// Every stuck node has at least one stuck predecessor, so the walk always
/// closes a loop.
fn find_cycle(graph: &DiGraph<usize, ()>, in_degree: &[usize]) -> Vec<usize> {
    let Some(start) = in_degree.iter().position(|&d| d > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen = vec![usize::MAX; in_degree.len()];
    seen[start] = 0;
    let mut current = start;
    loop {
        let Some(pred) = graph
            .neighbors_directed(NodeIndex::new(current), Direction::Incoming)
            .map(|n| n.index())
            .filter(|&p| in_degree[p] > 0)
            .min()
        else {
            return path;
        };
        if seen[pred] != usize::MAX {
            // Each step went from a node to one of its inputs.
            let mut cycle: Vec<usize> = path[seen[pred]..].to_vec();
            cycle.push(pred);
            return cycle;
        }
        seen[pred] = path.len();
        path.push(pred);
        current = pred;
    }
}
