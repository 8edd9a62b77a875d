//! One interface over the relational store of record and the optional graph
//! store.
//!
//! Writes land in the relational store inside a single transaction and are
//! then mirrored to the graph store on a best-effort basis. Graph-shaped reads
//! prefer the graph store and fall back to an edges-only view derived from the
//! relational rows when the graph store is absent, empty for the run, or
//! failing.

use crate::analytics::{
    AnalyticsLimits, CriticalReport, CycleReport, DependencyGraph, Direction, ImpactReport,
    analyze_impact, compute_metrics, find_cycles, rank_critical_files,
};
use crate::config::Config;
use crate::db::{Db, FileProfile, RunCounts};
use crate::error::{RpcError, RpcResult};
use crate::graph_store::{GraphBackend, GraphStore};
use crate::model::{
    Analysis, DependencyEdge, DependencyMap, GraphEdge, GraphNode, GraphOrigin, MetricsSnapshot,
    NewRun, Run, RunGraph, RunStatus, RunSummary, SourceFile, looks_like_copybook,
};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of a dependency save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub edges: usize,
    /// False when there is no graph store or the mirror write failed.
    pub mirrored: bool,
}

pub struct Repository {
    db: Db,
    graph: Option<Box<dyn GraphBackend>>,
    limits: AnalyticsLimits,
}

impl Repository {
    pub fn new(db: Db, graph: Option<Box<dyn GraphBackend>>, limits: AnalyticsLimits) -> Self {
        Self { db, graph, limits }
    }

    /// Open the relational store and, when a path is given, the graph store.
    pub fn open(db_path: &Path, graph_path: Option<&Path>) -> Result<Self> {
        let db = Db::new(db_path)?;
        let graph = match graph_path {
            Some(path) => Some(Box::new(GraphStore::open(path)?) as Box<dyn GraphBackend>),
            None => None,
        };
        Ok(Self::new(
            db,
            graph,
            AnalyticsLimits::from_config(Config::get()),
        ))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn create_run(&self, run: &NewRun) -> Result<i64> {
        let run_id = self.db.create_run(run)?;
        info!(run_id, source = %run.source_path, "run created");
        Ok(run_id)
    }

    pub fn complete_run(&self, run_id: i64, status: RunStatus, notes: Option<&str>) -> Result<()> {
        self.db.complete_run(run_id, status, notes)?;
        info!(run_id, %status, "run completed");
        Ok(())
    }

    pub fn update_notes(&self, run_id: i64, notes: &str) -> Result<()> {
        self.db.update_notes(run_id, notes)
    }

    pub fn save_source_files(&self, run_id: i64, files: &[SourceFile]) -> Result<usize> {
        self.db.replace_source_files(run_id, files)
    }

    pub fn save_analyses(&self, run_id: i64, analyses: &[Analysis]) -> Result<usize> {
        self.db.replace_analyses(run_id, analyses)
    }

    pub fn save_metrics(&self, run_id: i64, metrics: &MetricsSnapshot) -> Result<()> {
        self.db.replace_metrics(run_id, metrics)
    }

    /// Replace the run's edges in the store of record, then mirror them.
    ///
    /// A failed mirror is logged and reported in [`SaveReport::mirrored`]; it
    /// never undoes the relational write. The run is then cleared from the
    /// graph store so older mirrored rows cannot answer for it.
    pub fn save_dependencies(&self, run_id: i64, edges: &[DependencyEdge]) -> Result<SaveReport> {
        let saved = self.db.replace_dependencies(run_id, edges)?;
        let mirrored = match self.graph.as_deref() {
            Some(backend) => match self.mirror(backend, run_id, edges) {
                Ok(()) => true,
                Err(err) => {
                    warn!(run_id, backend = backend.name(), error = %err, "graph mirror failed");
                    discard_stale(backend, run_id);
                    false
                }
            },
            None => false,
        };
        Ok(SaveReport {
            edges: saved,
            mirrored,
        })
    }

    fn mirror(&self, backend: &dyn GraphBackend, run_id: i64, edges: &[DependencyEdge]) -> Result<()> {
        let graph_edges: Vec<GraphEdge> = edges.iter().map(GraphEdge::from).collect();
        let nodes = derive_nodes(&graph_edges, &self.profiles(run_id));
        backend.replace_run(run_id, &nodes, &graph_edges)
    }

    /// Re-mirror a run from the relational edges.
    pub fn rebuild_graph(&self, run_id: i64) -> RpcResult<usize> {
        let backend = self
            .graph
            .as_deref()
            .ok_or_else(|| RpcError::Unavailable("graph database".to_string()))?;
        if self.db.get_run(run_id)?.is_none() {
            return Err(RpcError::NotFound(format!("run {run_id}")));
        }
        let edges = self.db.list_dependencies(run_id)?;
        if let Err(err) = self.mirror(backend, run_id, &edges) {
            discard_stale(backend, run_id);
            return Err(err.into());
        }
        info!(run_id, edges = edges.len(), "graph rebuilt");
        Ok(edges.len())
    }

    /// Recompute the run's metrics from its stored files and edges and
    /// replace the snapshot.
    pub fn refresh_metrics(&self, run_id: i64) -> Result<MetricsSnapshot> {
        let files = self.db.list_source_files(run_id)?;
        let edges = self.db.list_dependencies(run_id)?;
        let metrics = compute_metrics(&files, &edges, &self.limits);
        self.db.replace_metrics(run_id, &metrics)?;
        debug!(run_id, circular = metrics.circular_count, "metrics refreshed");
        Ok(metrics)
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        self.db.get_run(run_id)
    }

    pub fn latest_run(&self) -> Result<Option<Run>> {
        self.db.latest_run()
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        self.db.list_runs(limit)
    }

    pub fn list_source_files(&self, run_id: i64) -> Result<Vec<SourceFile>> {
        self.db.list_source_files(run_id)
    }

    pub fn list_analyses(&self, run_id: i64) -> Result<Vec<Analysis>> {
        self.db.list_analyses(run_id)
    }

    pub fn get_analysis(&self, run_id: i64, program: &str) -> Result<Option<Analysis>> {
        self.db.get_analysis(run_id, program)
    }

    pub fn get_metrics(&self, run_id: i64) -> Result<Option<MetricsSnapshot>> {
        self.db.get_metrics(run_id)
    }

    pub fn dependency_map(&self, run_id: i64) -> Result<DependencyMap> {
        let edges = self.db.list_dependencies(run_id)?;
        let usage = self.db.list_usage(run_id)?;
        Ok(DependencyMap::new(run_id, edges, usage))
    }

    pub fn summary(&self, run_id: i64) -> Result<Option<RunSummary>> {
        let Some(run) = self.db.get_run(run_id)? else {
            return Ok(None);
        };
        let RunCounts {
            files,
            copybooks,
            analyses,
            fallback_analyses,
            dependencies,
        } = self.db.run_counts(run_id)?;
        Ok(Some(RunSummary {
            run,
            file_count: files,
            copybook_count: copybooks,
            analysis_count: analyses,
            fallback_analyses,
            dependency_count: dependencies,
            metrics: self.db.get_metrics(run_id)?,
        }))
    }

    /// The graph store when it is configured and holds the run.
    fn answering_backend(&self, run_id: i64) -> Option<&dyn GraphBackend> {
        let backend = self.graph.as_deref()?;
        match backend.has_run(run_id) {
            Ok(true) => Some(backend),
            Ok(false) => {
                debug!(run_id, "graph store has no nodes for run, using relational edges");
                None
            }
            Err(err) => {
                warn!(run_id, error = %err, "graph store unavailable, using relational edges");
                None
            }
        }
    }

    pub fn graph(&self, run_id: i64) -> Result<RunGraph> {
        let stored = self
            .answering_backend(run_id)
            .and_then(|backend| match backend.load_graph(run_id) {
                Ok(graph) if !graph.nodes.is_empty() => Some(graph),
                Ok(_) => None,
                Err(err) => {
                    warn!(run_id, error = %err, "graph store read failed, using relational edges");
                    None
                }
            });
        let mut graph = match stored {
            Some(graph) => graph,
            None => self.relational_graph(run_id)?,
        };
        self.enrich(&mut graph);
        Ok(graph)
    }

    /// Unranked, edges-only view derived from the flat edge rows.
    fn relational_graph(&self, run_id: i64) -> Result<RunGraph> {
        let edges: Vec<GraphEdge> = self
            .db
            .list_dependencies(run_id)?
            .iter()
            .map(GraphEdge::from)
            .collect();
        Ok(RunGraph {
            run_id,
            origin: GraphOrigin::Relational,
            ranked: false,
            nodes: derive_nodes(&edges, &BTreeMap::new()),
            edges,
        })
    }

    /// Fill in missing line counts and copybook flags from the file inventory.
    fn enrich(&self, graph: &mut RunGraph) {
        let profiles = self.profiles(graph.run_id);
        for node in &mut graph.nodes {
            if let Some(profile) = profiles.get(&node.name) {
                node.is_copybook |= profile.is_copybook;
                if node.line_count.is_none() {
                    node.line_count = Some(profile.content_lines);
                }
            }
        }
    }

    fn profiles(&self, run_id: i64) -> BTreeMap<String, FileProfile> {
        self.db.file_profiles(run_id).unwrap_or_else(|err| {
            warn!(run_id, error = %err, "file profiles unavailable, skipping enrichment");
            BTreeMap::new()
        })
    }

    pub fn node_exists(&self, run_id: i64, name: &str) -> Result<bool> {
        if let Some(backend) = self.answering_backend(run_id) {
            match backend.contains(run_id, name) {
                Ok(found) => return Ok(found),
                Err(err) => warn!(run_id, error = %err, "graph store lookup failed"),
            }
        }
        self.db.node_exists(run_id, name)
    }

    pub fn cycles(&self, run_id: i64) -> Result<CycleReport> {
        let graph = self.graph(run_id)?;
        let graph = DependencyGraph::from_edges(&graph.edges);
        Ok(find_cycles(&graph, &self.limits))
    }

    pub fn critical_files(&self, run_id: i64) -> Result<CriticalReport> {
        let limit = self.limits.critical_limit;
        if let Some(backend) = self.answering_backend(run_id) {
            match backend.critical_files(run_id, limit) {
                Ok(report) => return Ok(report),
                Err(err) => warn!(run_id, error = %err, "graph store ranking failed"),
            }
        }
        let edges = self.relational_graph(run_id)?.edges;
        Ok(rank_critical_files(&DependencyGraph::from_edges(&edges), limit))
    }

    /// Impact of changing `target`, or `None` when the run's graph does not
    /// contain it.
    pub fn impact(&self, run_id: i64, target: &str) -> Result<Option<ImpactReport>> {
        if let Some(backend) = self.answering_backend(run_id) {
            match self.backend_impact(backend, run_id, target) {
                Ok(report) => return Ok(report),
                Err(err) => warn!(run_id, error = %err, "graph store traversal failed"),
            }
        }
        let edges = self.relational_graph(run_id)?.edges;
        Ok(analyze_impact(
            &DependencyGraph::from_edges(&edges),
            target,
            &self.limits,
        ))
    }

    fn backend_impact(
        &self,
        backend: &dyn GraphBackend,
        run_id: i64,
        target: &str,
    ) -> Result<Option<ImpactReport>> {
        if !backend.contains(run_id, target)? {
            return Ok(None);
        }
        let depth = self.limits.impact_max_depth;
        let downstream = backend.reachable(run_id, target, Direction::Downstream, depth)?;
        let upstream = backend.reachable(run_id, target, Direction::Upstream, depth)?;
        Ok(Some(ImpactReport::new(target, depth, downstream, upstream)))
    }
}

/// Distinct endpoint names of `edges`, sorted, tagged from the inventory when
/// known and by extension otherwise.
fn discard_stale(backend: &dyn GraphBackend, run_id: i64) {
    if let Err(err) = backend.clear_run(run_id) {
        warn!(run_id, backend = backend.name(), error = %err, "could not clear stale graph rows");
    }
}

fn derive_nodes(edges: &[GraphEdge], profiles: &BTreeMap<String, FileProfile>) -> Vec<GraphNode> {
    let names: BTreeSet<&str> = edges
        .iter()
        .flat_map(|e| [e.source.as_str(), e.target.as_str()])
        .collect();
    names
        .into_iter()
        .map(|name| {
            let profile = profiles.get(name);
            GraphNode {
                name: name.to_string(),
                is_copybook: profile.map_or_else(|| looks_like_copybook(name), |p| p.is_copybook),
                line_count: profile.map(|p| p.content_lines),
                rank: None,
            }
        })
        .collect()
}
