// DAG validation
//
// Pure and total: every input yields a report, never a panic. Rules:
// 1. Every edge endpoint must name an existing node.
// 2. No self-loops.
// 3. The graph must be acyclic (Kahn's algorithm must visit every node).
//
// Tie-break when several nodes are ready: insertion order of `nodes[]`,
// which keeps the emitted execution order deterministic.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::workflow::{EdgeSpec, NodeSpec};

/// Outcome of DAG validation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DagReport {
    pub valid: bool,
    /// Topological linearization; empty when invalid
    pub execution_order: Vec<String>,
    pub errors: Vec<String>,
}

impl DagReport {
    fn invalid(errors: Vec<String>) -> Self {
        DagReport {
            valid: false,
            execution_order: Vec::new(),
            errors,
        }
    }
}

/// Validate the graph and emit a topological execution order
pub fn validate(nodes: &[NodeSpec], edges: &[EdgeSpec]) -> DagReport {
    let mut errors = Vec::new();

    // Node index by id; duplicate ids are a validation error
    let mut index_by_id: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (idx, node) in nodes.iter().enumerate() {
        if index_by_id.insert(node.id.as_str(), idx).is_some() {
            errors.push(format!("Duplicate node id: {}", node.id));
        }
    }

    for edge in edges {
        if !index_by_id.contains_key(edge.source.as_str()) {
            errors.push(format!(
                "Edge references unknown source node: {}",
                edge.source
            ));
        }
        if !index_by_id.contains_key(edge.target.as_str()) {
            errors.push(format!(
                "Edge references unknown target node: {}",
                edge.target
            ));
        }
        if edge.source == edge.target {
            errors.push(format!("Self-loop on node: {}", edge.source));
        }
    }

    if !errors.is_empty() {
        return DagReport::invalid(errors);
    }

    // Kahn's algorithm over node indexes. The ready set is ordered by
    // insertion index, giving the documented tie-break for free.
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];

    for edge in edges {
        let from = index_by_id[edge.source.as_str()];
        let to = index_by_id[edge.target.as_str()];
        adjacency[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut order: Vec<String> = Vec::with_capacity(nodes.len());

    while let Some(&idx) = ready.iter().next() {
        ready.remove(&idx);
        order.push(nodes[idx].id.clone());
        for &next in &adjacency[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != nodes.len() {
        let unvisited: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(idx, _)| nodes[idx].id.as_str())
            .collect();
        return DagReport::invalid(vec![format!(
            "Workflow contains a cycle involving: {}",
            unvisited.join(", ")
        )]);
    }

    DagReport {
        valid: true,
        execution_order: order,
        errors: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn node(id: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type: "output".to_string(),
            label: None,
            position: None,
            config: Map::new(),
        }
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            id: None,
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        }
    }

    #[test]
    fn linear_graph_is_ordered() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("a", "b"), edge("b", "c")];
        let report = validate(&nodes, &edges);
        assert!(report.valid);
        assert_eq!(report.execution_order, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_preserves_insertion_order_tie_break() {
        // b and c are both ready after a; b was inserted first
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let edges = vec![
            edge("a", "b"),
            edge("a", "c"),
            edge("b", "d"),
            edge("c", "d"),
        ];
        let report = validate(&nodes, &edges);
        assert!(report.valid);
        assert_eq!(report.execution_order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn independent_roots_follow_insertion_order() {
        let nodes = vec![node("z"), node("a"), node("m")];
        let report = validate(&nodes, &[]);
        assert!(report.valid);
        assert_eq!(report.execution_order, vec!["z", "a", "m"]);
    }

    #[test]
    fn cycle_is_rejected_with_empty_order() {
        let nodes = vec![node("a"), node("b")];
        let edges = vec![edge("a", "b"), edge("b", "a")];
        let report = validate(&nodes, &edges);
        assert!(!report.valid);
        assert!(report.execution_order.is_empty());
        assert!(report.errors[0].contains("cycle"));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let nodes = vec![node("a")];
        let edges = vec![edge("a", "ghost")];
        let report = validate(&nodes, &edges);
        assert!(!report.valid);
        assert!(report.errors[0].contains("ghost"));
    }

    #[test]
    fn self_loop_is_rejected() {
        let nodes = vec![node("a")];
        let edges = vec![edge("a", "a")];
        let report = validate(&nodes, &edges);
        assert!(!report.valid);
        assert!(report.errors[0].contains("Self-loop"));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let nodes = vec![node("a"), node("a")];
        let report = validate(&nodes, &[]);
        assert!(!report.valid);
        assert!(report.errors[0].contains("Duplicate"));
    }
}
