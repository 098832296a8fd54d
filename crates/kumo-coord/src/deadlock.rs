//! Wait-for-graph deadlock detection.
//!
//! The graph is rebuilt from the lock table on every scan (it is O(table
//! size) and runs off the apply path) and searched with an iterative DFS.
//! For each cycle, the victim is the youngest waiter: the client whose
//! pending request has the highest enqueue index, with the lexicographically
//! greatest client id breaking ties.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Find all distinct cycles in the wait-for graph.
///
/// Edges are `(waiter, holder)` pairs. Returns each cycle as the list of
/// clients on it. Nodes are visited in sorted order so the result is
/// deterministic across replicas.
pub fn find_cycles(edges: &[(String, String)]) -> Vec<Vec<String>> {
    let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (from, to) in edges {
        graph.entry(from).or_default().insert(to);
        graph.entry(to).or_default();
    }

    let mut cycles = Vec::new();
    let mut visited: BTreeSet<&str> = BTreeSet::new();

    for &start in graph.keys() {
        if visited.contains(start) {
            continue;
        }

        // Iterative DFS with an explicit path stack.
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<(&str, Vec<&str>)> = vec![(
            start,
            graph.get(start).map(|s| s.iter().copied().collect()).unwrap_or_default(),
        )];
        path.push(start);
        on_path.insert(start);
        visited.insert(start);

        while let Some((_, neighbors)) = stack.last_mut() {
            if let Some(next) = neighbors.pop() {
                if on_path.contains(next) {
                    // Cycle: everything from `next` to the path tail.
                    let from = path.iter().position(|&n| n == next).unwrap_or(0);
                    cycles.push(path[from..].iter().map(|s| s.to_string()).collect());
                } else if !visited.contains(next) {
                    visited.insert(next);
                    path.push(next);
                    on_path.insert(next);
                    stack.push((
                        next,
                        graph.get(next).map(|s| s.iter().copied().collect()).unwrap_or_default(),
                    ));
                }
            } else {
                let (done, _) = stack.pop().unwrap_or((start, Vec::new()));
                on_path.remove(done);
                path.pop();
            }
        }
    }

    cycles
}

/// Pick the victim for one cycle: youngest request first, tie on client id.
pub fn select_victim(cycle: &[String], ages: &HashMap<String, u64>) -> Option<String> {
    cycle
        .iter()
        .max_by_key(|client| (ages.get(*client).copied().unwrap_or(0), (*client).clone()))
        .cloned()
}

/// Full scan: cycles in the graph, one victim per cycle, deduplicated.
pub fn victims(edges: &[(String, String)], ages: &HashMap<String, u64>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cycle in find_cycles(edges) {
        if let Some(victim) = select_victim(&cycle, ages) {
            if !out.contains(&victim) {
                out.push(victim);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    fn ages(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(c, a)| (c.to_string(), *a)).collect()
    }

    #[test]
    fn no_cycle_in_a_chain() {
        let found = find_cycles(&edges(&[("a", "b"), ("b", "c")]));
        assert!(found.is_empty());
    }

    #[test]
    fn two_party_cycle_found() {
        let found = find_cycles(&edges(&[("x", "y"), ("y", "x")]));
        assert_eq!(found.len(), 1);
        let mut cycle = found[0].clone();
        cycle.sort();
        assert_eq!(cycle, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn three_party_cycle_found() {
        let found = find_cycles(&edges(&[("a", "b"), ("b", "c"), ("c", "a")]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].len(), 3);
    }

    #[test]
    fn victim_is_youngest_request() {
        let cycle = vec!["x".to_string(), "y".to_string()];
        // y enqueued later (higher index) -> y is the victim.
        let victim = select_victim(&cycle, &ages(&[("x", 3), ("y", 7)]));
        assert_eq!(victim, Some("y".to_string()));
    }

    #[test]
    fn victim_tie_breaks_on_client_id() {
        let cycle = vec!["x".to_string(), "y".to_string()];
        let victim = select_victim(&cycle, &ages(&[("x", 5), ("y", 5)]));
        assert_eq!(victim, Some("y".to_string()));
    }

    #[test]
    fn disjoint_cycles_yield_one_victim_each() {
        let all = victims(
            &edges(&[("a", "b"), ("b", "a"), ("c", "d"), ("d", "c")]),
            &ages(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]),
        );
        assert_eq!(all.len(), 2);
        assert!(all.contains(&"b".to_string()));
        assert!(all.contains(&"d".to_string()));
    }

    #[test]
    fn self_edge_is_ignored_upstream_but_detected_here() {
        // The lock table never emits self-edges, but the detector stays
        // well-behaved if one appears.
        let found = find_cycles(&edges(&[("a", "a")]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], vec!["a".to_string()]);
    }
}
