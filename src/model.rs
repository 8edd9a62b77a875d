use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    NoFiles,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::NoFiles => "NoFiles",
        }
    }

    /// Completed and failed runs are read-only.
    pub fn is_sealed(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(RunStatus::Running),
            "Completed" => Ok(RunStatus::Completed),
            "Failed" => Ok(RunStatus::Failed),
            "NoFiles" => Ok(RunStatus::NoFiles),
            other => anyhow::bail!("unknown run status {other:?}"),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Run {
    pub id: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
    pub source_path: String,
    pub output_path: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRun {
    /// Explicit id; assigned by the store when absent.
    pub id: Option<i64>,
    pub source_path: String,
    pub output_path: String,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceFile {
    pub name: String,
    pub path: String,
    pub is_copybook: bool,
    #[serde(skip_serializing, default)]
    pub content: String,
    pub line_count: i64,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let content = content.into();
        Self {
            is_copybook: looks_like_copybook(&name),
            line_count: content.lines().count() as i64,
            name,
            path: path.into(),
            content,
        }
    }
}

/// Copybooks are recognised by extension when nothing better is known.
pub fn looks_like_copybook(name: &str) -> bool {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    matches!(ext.as_deref(), Some("cpy" | "copy" | "cpb"))
}


#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Analysis {
    pub file_name: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paragraphs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub divisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copybooks: Vec<String>,
    /// Set on fallback records written when generation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Analysis {
    pub fn fallback(file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let reason = reason.into();
        Self {
            text: format!("Analysis unavailable for {file_name}: {reason}"),
            file_name,
            failure: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EdgeType {
    Call,
    Copy,
    Perform,
    Exec,
    Read,
    Write,
    Open,
    Close,
}

impl EdgeType {
    pub const ALL: [EdgeType; 8] = [
        EdgeType::Call,
        EdgeType::Copy,
        EdgeType::Perform,
        EdgeType::Exec,
        EdgeType::Read,
        EdgeType::Write,
        EdgeType::Open,
        EdgeType::Close,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Call => "CALL",
            EdgeType::Copy => "COPY",
            EdgeType::Perform => "PERFORM",
            EdgeType::Exec => "EXEC",
            EdgeType::Read => "READ",
            EdgeType::Write => "WRITE",
            EdgeType::Open => "OPEN",
            EdgeType::Close => "CLOSE",
        }
    }
}

impl FromStr for EdgeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown dependency type {s:?}"))
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl DependencyEdge {
    pub fn new(source: &str, target: &str, kind: EdgeType, line: Option<i64>) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            line,
            context: None,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FileUsage {
    pub file_name: String,
    /// Number of edges pointing at the file.
    pub usage_count: i64,
    /// Number of distinct files pointing at it.
    pub dependent_count: i64,
}

/// Fan-in and fan-out of a node, counted over distinct edges.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct NodeRank {
    pub incoming: usize,
    pub outgoing: usize,
    pub score: usize,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub is_copybook: bool,
    pub line_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<NodeRank>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeType,
    pub line: Option<i64>,
}

impl From<&DependencyEdge> for GraphEdge {
    fn from(edge: &DependencyEdge) -> Self {
        GraphEdge {
            source: edge.source.clone(),
            target: edge.target.clone(),
            kind: edge.kind,
            line: edge.line,
        }
    }
}

/// Which store answered a graph-shaped query.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraphOrigin {
    GraphStore,
    Relational,
}

#[derive(Debug, Serialize, Clone)]
pub struct RunGraph {
    pub run_id: i64,
    pub origin: GraphOrigin,
    /// Every node carries a [`NodeRank`]; only the graph store computes them.
    pub ranked: bool,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub total_files: i64,
    pub total_programs: i64,
    pub total_copybooks: i64,
    pub total_lines: i64,
    pub total_dependencies: i64,
    pub most_used_file: Option<String>,
    pub most_used_count: i64,
    pub circular_count: i64,
    pub circular_summary: Option<String>,
    pub insight: String,
    pub diagram: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct RunSummary {
    pub run: Run,
    pub file_count: i64,
    pub copybook_count: i64,
    pub analysis_count: i64,
    pub fallback_analyses: i64,
    pub dependency_count: i64,
    pub metrics: Option<MetricsSnapshot>,
}

#[derive(Debug, Serialize, Clone)]
pub struct DependencyMap {
    pub run_id: i64,
    pub edges: Vec<DependencyEdge>,
    pub usage: Vec<FileUsage>,
    pub by_type: BTreeMap<String, usize>,
}

impl DependencyMap {
    pub fn new(run_id: i64, edges: Vec<DependencyEdge>, usage: Vec<FileUsage>) -> Self {
        let mut by_type = BTreeMap::new();
        for edge in &edges {
            *by_type.entry(edge.kind.as_str().to_string()).or_insert(0) += 1;
        }
        Self {
            run_id,
            edges,
            usage,
            by_type,
        }
    }
}
