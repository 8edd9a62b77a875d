use super::DependencyGraph;
use serde::Serialize;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CriticalFile {
    pub name: String,
    pub incoming: usize,
    pub outgoing: usize,
    pub score: usize,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CriticalReport {
    pub files: Vec<CriticalFile>,
    pub limit: usize,
}

/// Rank files by fan-in + fan-out, highest first, ties broken by name.
///
/// Both raw counts are kept so a shared copybook (all incoming) can be told
/// apart from an orchestrating program (all outgoing).
pub fn rank_critical_files(graph: &DependencyGraph, limit: usize) -> CriticalReport {
    let mut files: Vec<CriticalFile> = graph
        .nodes()
        .map(|name| {
            let incoming = graph.in_degree(name);
            let outgoing = graph.out_degree(name);
            CriticalFile {
                name: name.to_string(),
                incoming,
                outgoing,
                score: incoming + outgoing,
            }
        })
        .collect();
    files.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    files.truncate(limit);
    CriticalReport { files, limit }
}
