use super::{AnalyticsLimits, DependencyGraph, find_cycles};
use crate::model::{DependencyEdge, EdgeType, GraphEdge, MetricsSnapshot, SourceFile};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

const SUMMARY_CYCLES: usize = 5;
const DIAGRAM_EDGES: usize = 200;

/// Recompute the per-run metrics snapshot from the stored files and edges.
pub fn compute_metrics(
    files: &[SourceFile],
    edges: &[DependencyEdge],
    limits: &AnalyticsLimits,
) -> MetricsSnapshot {
    let copybooks = files.iter().filter(|f| f.is_copybook).count() as i64;
    let total_lines = files.iter().map(|f| f.line_count).sum();

    let (most_used_file, most_used_count) = most_used_shared_file(files, edges);

    let graph_edges: Vec<GraphEdge> = edges.iter().map(GraphEdge::from).collect();
    let graph = DependencyGraph::from_edges(&graph_edges);
    let cycles = find_cycles(&graph, limits);
    let circular_summary = if cycles.cycles.is_empty() {
        None
    } else {
        let mut shown: Vec<String> = cycles
            .cycles
            .iter()
            .take(SUMMARY_CYCLES)
            .map(|cycle| format!("{} -> {}", cycle.path.join(" -> "), cycle.path[0]))
            .collect();
        if cycles.cycles.len() > SUMMARY_CYCLES || cycles.truncated {
            shown.push("...".to_string());
        }
        Some(shown.join("; "))
    };

    let mut metrics = MetricsSnapshot {
        total_files: files.len() as i64,
        total_programs: files.len() as i64 - copybooks,
        total_copybooks: copybooks,
        total_lines,
        total_dependencies: edges.len() as i64,
        most_used_file,
        most_used_count,
        circular_count: cycles.cycles.len() as i64,
        circular_summary,
        insight: String::new(),
        diagram: mermaid_diagram(edges),
    };
    metrics.insight = insight_text(&metrics, graph.node_count());
    metrics
}

/// The copybook included by the most distinct files; any target when the
/// run has no COPY edges.
fn most_used_shared_file(files: &[SourceFile], edges: &[DependencyEdge]) -> (Option<String>, i64) {
    let copybooks: BTreeSet<&str> = files
        .iter()
        .filter(|f| f.is_copybook)
        .map(|f| f.name.as_str())
        .collect();
    let shared = |edge: &&DependencyEdge| {
        edge.kind == EdgeType::Copy || copybooks.contains(edge.target.as_str())
    };
    let pick = |filter: &dyn Fn(&&DependencyEdge) -> bool| {
        let mut users: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for edge in edges.iter().filter(|e| filter(e)) {
            users.entry(&edge.target).or_default().insert(&edge.source);
        }
        users
            .into_iter()
            .map(|(name, sources)| (name, sources.len()))
            .fold(None, |best: Option<(&str, usize)>, (name, count)| match best {
                Some((_, top)) if top >= count => best,
                _ => Some((name, count)),
            })
    };
    pick(&shared)
        .or_else(|| pick(&|_| true))
        .map(|(name, count)| (Some(name.to_string()), count as i64))
        .unwrap_or((None, 0))
}

fn insight_text(metrics: &MetricsSnapshot, node_count: usize) -> String {
    let mut text = format!(
        "{} files ({} programs, {} copybooks, {} lines) with {} dependencies across {} connected files.",
        metrics.total_files,
        metrics.total_programs,
        metrics.total_copybooks,
        metrics.total_lines,
        metrics.total_dependencies,
        node_count,
    );
    if let Some(name) = &metrics.most_used_file {
        let _ = write!(
            text,
            " {name} is the most shared file, used by {} files.",
            metrics.most_used_count
        );
    }
    match metrics.circular_count {
        0 => text.push_str(" No circular dependencies were found."),
        1 => text.push_str(" One circular dependency needs attention."),
        n => {
            let _ = write!(text, " {n} circular dependencies need attention.");
        }
    }
    text
}

/// Mermaid flowchart of distinct (source, target, type) edges.
fn mermaid_diagram(edges: &[DependencyEdge]) -> String {
    let distinct: BTreeSet<(&str, &str, EdgeType)> = edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str(), e.kind))
        .collect();
    let mut out = String::from("graph LR\n");
    for (source, target, kind) in distinct.iter().take(DIAGRAM_EDGES) {
        let _ = writeln!(
            out,
            "    {}[\"{}\"] -->|{}| {}[\"{}\"]",
            node_id(source),
            source,
            kind,
            node_id(target),
            target
        );
    }
    if distinct.len() > DIAGRAM_EDGES {
        let _ = writeln!(out, "    %% {} more edges omitted", distinct.len() - DIAGRAM_EDGES);
    }
    out
}

fn node_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
