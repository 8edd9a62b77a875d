use super::{AnalyticsLimits, DependencyGraph};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Direction to traverse the dependency graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow edges in reverse: who depends on this file.
    Downstream,
    /// Follow edges forward: what this file depends on.
    Upstream,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ImpactEntry {
    pub name: String,
    pub distance: usize,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ImpactReport {
    pub target: String,
    pub max_depth: usize,
    /// Files that break if the target changes.
    pub downstream: Vec<ImpactEntry>,
    /// Files the target relies on.
    pub upstream: Vec<ImpactEntry>,
    pub downstream_count: usize,
    pub upstream_count: usize,
    /// True when a traversal stopped at `max_depth` with files still beyond it.
    pub truncated: bool,
}

impl ImpactReport {
    pub fn new(
        target: &str,
        max_depth: usize,
        downstream: Reach,
        upstream: Reach,
    ) -> Self {
        Self {
            target: target.to_string(),
            max_depth,
            downstream_count: downstream.entries.len(),
            upstream_count: upstream.entries.len(),
            truncated: downstream.truncated || upstream.truncated,
            downstream: downstream.entries,
            upstream: upstream.entries,
        }
    }
}

/// Files reachable from a start file, each at its minimal hop distance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reach {
    pub entries: Vec<ImpactEntry>,
    pub truncated: bool,
}

impl Reach {
    /// Build from (name, distance) pairs explored one hop past `max_depth`;
    /// anything beyond the cap only marks the result truncated.
    pub fn from_distances<I>(distances: I, max_depth: usize) -> Self
    where
        I: IntoIterator<Item = (String, usize)>,
    {
        let mut truncated = false;
        let mut entries: Vec<ImpactEntry> = distances
            .into_iter()
            .filter(|(_, distance)| {
                let inside = *distance <= max_depth;
                truncated |= !inside;
                inside
            })
            .map(|(name, distance)| ImpactEntry { name, distance })
            .collect();
        entries.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.name.cmp(&b.name)));
        Self { entries, truncated }
    }
}

/// Breadth-first search from `start`, bounded at `max_depth` hops.
pub fn reachable(
    graph: &DependencyGraph,
    start: &str,
    direction: Direction,
    max_depth: usize,
) -> Reach {
    let mut distances: HashMap<&str, usize> = HashMap::new();
    let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
    distances.insert(start, 0);
    queue.push_back((start, 0));

    // explore one hop past the cap to learn whether it cut anything off
    let horizon = max_depth.saturating_add(1);
    while let Some((name, dist)) = queue.pop_front() {
        if dist >= horizon {
            continue;
        }
        let neighbors: Vec<&str> = match direction {
            Direction::Downstream => graph.predecessors(name).collect(),
            Direction::Upstream => graph.successors(name).collect(),
        };
        for next in neighbors {
            if distances.contains_key(next) {
                continue;
            }
            distances.insert(next, dist + 1);
            queue.push_back((next, dist + 1));
        }
    }

    distances.remove(start);
    Reach::from_distances(
        distances
            .into_iter()
            .map(|(name, distance)| (name.to_string(), distance)),
        max_depth,
    )
}

/// Impact of changing `target`, or `None` when the file is not in the graph.
pub fn analyze_impact(
    graph: &DependencyGraph,
    target: &str,
    limits: &AnalyticsLimits,
) -> Option<ImpactReport> {
    if !graph.contains(target) {
        return None;
    }
    let depth = limits.impact_max_depth;
    Some(ImpactReport::new(
        target,
        depth,
        reachable(graph, target, Direction::Downstream, depth),
        reachable(graph, target, Direction::Upstream, depth),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::edge;
    use super::*;

    fn names(entries: &[ImpactEntry]) -> Vec<(&str, usize)> {
        entries.iter().map(|e| (e.name.as_str(), e.distance)).collect()
    }

    #[test]
    fn single_edge_is_symmetric() {
        // A depends on B: changing B breaks A, A relies on B
        let graph = DependencyGraph::from_edges(&[edge("A", "B")]);
        let limits = AnalyticsLimits::default();
        let b = analyze_impact(&graph, "B", &limits).unwrap();
        assert_eq!(names(&b.downstream), vec![("A", 1)]);
        assert!(b.upstream.is_empty());
        let a = analyze_impact(&graph, "A", &limits).unwrap();
        assert_eq!(names(&a.upstream), vec![("B", 1)]);
        assert!(a.downstream.is_empty());
    }

    #[test]
    fn minimal_distance_wins() {
        let graph = DependencyGraph::from_edges(&[
            edge("A", "B"),
            edge("B", "C"),
            edge("A", "C"),
            edge("C", "D"),
        ]);
        let reach = reachable(&graph, "A", Direction::Upstream, 5);
        assert_eq!(names(&reach.entries), vec![("B", 1), ("C", 1), ("D", 2)]);
        assert!(!reach.truncated);
    }

    #[test]
    fn depth_cap_truncates() {
        let graph = DependencyGraph::from_edges(&[
            edge("A", "B"),
            edge("B", "C"),
            edge("C", "D"),
        ]);
        let reach = reachable(&graph, "A", Direction::Upstream, 2);
        assert_eq!(names(&reach.entries), vec![("B", 1), ("C", 2)]);
        assert!(reach.truncated);

        let exact = reachable(&graph, "A", Direction::Upstream, 3);
        assert_eq!(exact.entries.len(), 3);
        assert!(!exact.truncated);
    }

    #[test]
    fn cycles_terminate_and_skip_start() {
        let graph = DependencyGraph::from_edges(&[edge("A", "C"), edge("C", "A")]);
        let reach = reachable(&graph, "A", Direction::Downstream, 5);
        assert_eq!(names(&reach.entries), vec![("C", 1)]);
    }

    #[test]
    fn missing_target_is_none() {
        let graph = DependencyGraph::from_edges(&[edge("A", "B")]);
        assert!(analyze_impact(&graph, "Z", &AnalyticsLimits::default()).is_none());
    }
}
