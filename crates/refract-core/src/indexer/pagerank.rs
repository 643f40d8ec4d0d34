//! PageRank computation over file-level graph edges.

use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_DAMPING: f64 = 0.85;
pub const DEFAULT_EPSILON: f64 = 1e-6;
const MAX_ITERATIONS: usize = 200;

/// Damped PageRank with dangling-mass redistribution. Scores sum to 1.
pub fn compute_pagerank(
    nodes: &BTreeSet<String>,
    edges: &[(String, String)],
    damping: f64,
    epsilon: f64,
) -> BTreeMap<String, f64> {
    if nodes.is_empty() {
        return BTreeMap::new();
    }

    let mut adjacency: BTreeMap<&str, Vec<&str>> =
        nodes.iter().map(|n| (n.as_str(), Vec::new())).collect();
    for (source, target) in edges {
        if source != target && nodes.contains(target) {
            if let Some(targets) = adjacency.get_mut(source.as_str()) {
                targets.push(target.as_str());
            }
        }
    }

    let node_count = nodes.len() as f64;
    let base_score = 1.0 / node_count;
    let mut scores: BTreeMap<&str, f64> = nodes.iter().map(|n| (n.as_str(), base_score)).collect();

    for _ in 0..MAX_ITERATIONS {
        let dangling_mass: f64 = adjacency
            .iter()
            .filter(|(_, targets)| targets.is_empty())
            .map(|(id, _)| scores[id])
            .sum();
        let floor = (1.0 - damping) / node_count + damping * dangling_mass / node_count;
        let mut next_scores: BTreeMap<&str, f64> =
            nodes.iter().map(|n| (n.as_str(), floor)).collect();

        for (&source, targets) in &adjacency {
            if targets.is_empty() {
                continue;
            }
            let share = damping * scores[source] / targets.len() as f64;
            for &target in targets {
                if let Some(score) = next_scores.get_mut(target) {
                    *score += share;
                }
            }
        }

        let delta: f64 = nodes
            .iter()
            .map(|n| (next_scores[n.as_str()] - scores[n.as_str()]).abs())
            .sum();
        scores = next_scores;
        if delta <= epsilon {
            break;
        }
    }

    scores
        .into_iter()
        .map(|(node, score)| (node.to_string(), score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nodes: &[&str]) -> BTreeSet<String> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    fn edge(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_scores_sum_to_one() {
        let nodes = set(&["a", "b", "c"]);
        let scores = compute_pagerank(
            &nodes,
            &[edge("a", "b"), edge("c", "b")],
            DEFAULT_DAMPING,
            DEFAULT_EPSILON,
        );
        let total: f64 = scores.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(scores["b"] > scores["a"]);
        assert!(scores["b"] > scores["c"]);
    }

    #[test]
    fn test_empty_graph() {
        assert!(compute_pagerank(&BTreeSet::new(), &[], DEFAULT_DAMPING, DEFAULT_EPSILON).is_empty());
    }

    #[test]
    fn test_edges_to_unknown_nodes_ignored() {
        let nodes = set(&["a"]);
        let scores = compute_pagerank(&nodes, &[edge("a", "zzz")], DEFAULT_DAMPING, DEFAULT_EPSILON);
        assert!((scores["a"] - 1.0).abs() < 1e-9);
    }
}
