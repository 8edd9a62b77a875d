//! Graph analytics over the dependency multigraph of a single run.
//!
//! Every query here is bounded: cycle detection by length and count, impact
//! traversal by hop distance, critical-file ranking by result size. The
//! bounds live in [`AnalyticsLimits`].

pub mod critical;
pub mod cycles;
pub mod impact;
pub mod metrics;

pub use critical::{CriticalFile, CriticalReport, rank_critical_files};
pub use cycles::{Cycle, CycleReport, find_cycles};
pub use impact::{Direction, ImpactEntry, ImpactReport, Reach, analyze_impact, reachable};
pub use metrics::compute_metrics;

use crate::config::Config;
use crate::model::{EdgeType, GraphEdge};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Caps applied to graph queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsLimits {
    /// Longest cycle (in nodes) that is reported.
    pub cycle_max_depth: usize,
    pub max_cycles: usize,
    pub impact_max_depth: usize,
    pub critical_limit: usize,
}

impl Default for AnalyticsLimits {
    fn default() -> Self {
        Self {
            cycle_max_depth: 10,
            max_cycles: 50,
            impact_max_depth: 5,
            critical_limit: 20,
        }
    }
}

impl AnalyticsLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cycle_max_depth: config.cycle_max_depth,
            max_cycles: config.max_cycles,
            impact_max_depth: config.impact_max_depth,
            critical_limit: config.critical_limit,
        }
    }
}

/// Adjacency view of a run's edges.
///
/// Parallel edges collapse into one neighbour for traversal but are still
/// counted individually for fan-in/fan-out, where an edge is identified by
/// (source, target, type, line).
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    outgoing: BTreeMap<String, BTreeSet<String>>,
    incoming: BTreeMap<String, BTreeSet<String>>,
    out_degree: BTreeMap<String, usize>,
    in_degree: BTreeMap<String, usize>,
}

impl DependencyGraph {
    pub fn from_edges<'a, I>(edges: I) -> Self
    where
        I: IntoIterator<Item = &'a GraphEdge>,
    {
        let mut graph = DependencyGraph::default();
        let mut seen: HashSet<(&str, &str, EdgeType, Option<i64>)> = HashSet::new();
        for edge in edges {
            graph.touch(&edge.source);
            graph.touch(&edge.target);
            if !seen.insert((&edge.source, &edge.target, edge.kind, edge.line)) {
                continue;
            }
            *graph.out_degree.entry(edge.source.clone()).or_default() += 1;
            *graph.in_degree.entry(edge.target.clone()).or_default() += 1;
            if let Some(targets) = graph.outgoing.get_mut(&edge.source) {
                targets.insert(edge.target.clone());
            }
            if let Some(sources) = graph.incoming.get_mut(&edge.target) {
                sources.insert(edge.source.clone());
            }
        }
        graph
    }

    fn touch(&mut self, name: &str) {
        if !self.outgoing.contains_key(name) {
            self.outgoing.insert(name.to_string(), BTreeSet::new());
            self.incoming.insert(name.to_string(), BTreeSet::new());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outgoing.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Node names in lexicographic order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.outgoing.keys().map(String::as_str)
    }

    pub fn successors<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.outgoing
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn predecessors<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.incoming
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn in_degree(&self, name: &str) -> usize {
        self.in_degree.get(name).copied().unwrap_or(0)
    }

    pub fn out_degree(&self, name: &str) -> usize {
        self.out_degree.get(name).copied().unwrap_or(0)
    }
}
