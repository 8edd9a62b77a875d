use super::{AnalyticsLimits, DependencyGraph};
use serde::Serialize;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Files in traversal order, starting at the lexicographically smallest.
    /// The closing edge back to `path[0]` is implied.
    pub path: Vec<String>,
    pub length: usize,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycles: Vec<Cycle>,
    pub max_depth: usize,
    /// True when more cycles exist than `max_cycles` allowed.
    pub truncated: bool,
}

/// Enumerate simple directed cycles of 2..=`cycle_max_depth` files, shortest
/// first (ties by path), keeping at most `max_cycles`.
///
/// One depth-first pass per start file collects every length at once. Once
/// enough cycles are held, the depth bound drops to the longest one kept, so
/// a cap never hides a shorter cycle behind a longer one. Each cycle is
/// rooted at its smallest file name, which makes every rotation of it the
/// same result. Self-loops are ignored.
pub fn find_cycles(graph: &DependencyGraph, limits: &AnalyticsLimits) -> CycleReport {
    let mut search = CycleSearch {
        graph,
        // one extra so truncation is observable
        keep: limits.max_cycles.saturating_add(1),
        depth: limits.cycle_max_depth,
        found: Vec::new(),
    };
    for start in graph.nodes() {
        let mut path = vec![start];
        search.walk(start, &mut path);
    }
    search.compact();

    let mut cycles = search.found;
    let truncated = cycles.len() > limits.max_cycles;
    cycles.truncate(limits.max_cycles);
    CycleReport {
        cycles,
        max_depth: limits.cycle_max_depth,
        truncated,
    }
}

struct CycleSearch<'a> {
    graph: &'a DependencyGraph,
    keep: usize,
    /// Longest path still worth extending.
    depth: usize,
    found: Vec<Cycle>,
}

impl<'a> CycleSearch<'a> {
    fn walk(&mut self, start: &'a str, path: &mut Vec<&'a str>) {
        let Some(current) = path.last().copied() else {
            return;
        };
        let graph = self.graph;
        for next in graph.successors(current) {
            if next == start {
                if path.len() >= 2 {
                    self.record(path);
                }
                continue;
            }
            if path.len() >= self.depth || next < start || path.contains(&next) {
                continue;
            }
            path.push(next);
            self.walk(start, path);
            path.pop();
        }
    }

    fn record(&mut self, path: &[&str]) {
        self.found.push(Cycle {
            path: path.iter().map(|name| name.to_string()).collect(),
            length: path.len(),
        });
        if self.found.len() >= self.keep.saturating_mul(2) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        self.found
            .sort_by(|a, b| a.length.cmp(&b.length).then_with(|| a.path.cmp(&b.path)));
        self.found.truncate(self.keep);
        if self.found.len() == self.keep {
            if let Some(longest) = self.found.last() {
                self.depth = self.depth.min(longest.length);
            }
        }
    }
}
