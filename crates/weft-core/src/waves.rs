// Wave planning
//
// A wave is a topological level: L(n) = max(L(parent) + 1), defaulting to 0.
// Nodes in the same wave have no mutual dependencies, so waves expose the
// graph's parallelism potential. The reference engine still executes nodes
// sequentially in topological order within each wave, which keeps observable
// step order deterministic.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::workflow::EdgeSpec;

/// Topological levels, each preserving topological order within the level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavePlan {
    pub waves: Vec<Vec<String>>,
}

impl WavePlan {
    /// Compact JSON form recorded under `knowledge["scheduler.waves"]`
    pub fn to_summary(&self) -> Value {
        json!({
            "count": self.waves.len(),
            "waves": self.waves,
        })
    }
}

/// Group a validated topological order into waves
pub fn plan(execution_order: &[String], edges: &[EdgeSpec]) -> WavePlan {
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        parents
            .entry(edge.target.as_str())
            .or_default()
            .push(edge.source.as_str());
    }

    // Walking in topological order guarantees parent levels are known
    let mut level_of: HashMap<&str, usize> = HashMap::with_capacity(execution_order.len());
    let mut waves: Vec<Vec<String>> = Vec::new();

    for node_id in execution_order {
        let level = parents
            .get(node_id.as_str())
            .map(|ps| {
                ps.iter()
                    .filter_map(|p| level_of.get(p))
                    .map(|l| l + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        level_of.insert(node_id.as_str(), level);

        if waves.len() <= level {
            waves.resize_with(level + 1, Vec::new);
        }
        waves[level].push(node_id.clone());
    }

    WavePlan { waves }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            id: None,
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        }
    }

    fn order(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn linear_chain_is_one_node_per_wave() {
        let plan = plan(&order(&["a", "b", "c"]), &[edge("a", "b"), edge("b", "c")]);
        assert_eq!(plan.waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_groups_the_middle() {
        let edges = vec![
            edge("a", "b"),
            edge("a", "c"),
            edge("b", "d"),
            edge("c", "d"),
        ];
        let plan = plan(&order(&["a", "b", "c", "d"]), &edges);
        assert_eq!(plan.waves, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn level_is_longest_path_not_shortest() {
        // d has parents at levels 0 (a) and 2 (c): it lands at level 3
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("a", "d"), edge("c", "d")];
        let plan = plan(&order(&["a", "b", "c", "d"]), &edges);
        assert_eq!(
            plan.waves,
            vec![vec!["a"], vec!["b"], vec!["c"], vec!["d"]]
        );
    }

    #[test]
    fn disconnected_nodes_share_wave_zero() {
        let plan = plan(&order(&["a", "b"]), &[]);
        assert_eq!(plan.waves, vec![vec!["a", "b"]]);
    }

    #[test]
    fn summary_counts_waves() {
        let plan = plan(&order(&["a", "b"]), &[edge("a", "b")]);
        let summary = plan.to_summary();
        assert_eq!(summary["count"], 2);
    }
}
