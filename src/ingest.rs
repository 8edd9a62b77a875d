//! Persisting a finished analysis pipeline as a run.
//!
//! Discovery, per-file analysis and dependency extraction are external
//! collaborators behind traits. [`ingest_run`] drives them, writes every
//! collection through the repository, recomputes metrics, and seals the run.

use crate::error::{ExternalError, classify};
use crate::model::{Analysis, DependencyEdge, MetricsSnapshot, NewRun, RunStatus, SourceFile};
use crate::repository::Repository;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

pub trait FileDiscovery {
    fn discover(&self) -> Result<Vec<SourceFile>, ExternalError>;
}

pub trait AnalysisGenerator {
    fn analyze(&self, file: &SourceFile) -> Result<Analysis, ExternalError>;
}

pub trait DependencyExtractor {
    fn extract(&self, files: &[SourceFile]) -> Result<Vec<DependencyEdge>, ExternalError>;
}

#[derive(Debug, Serialize, Clone)]
pub struct IngestReport {
    pub run_id: i64,
    pub status: RunStatus,
    pub files: usize,
    pub analyses: usize,
    pub fallback_analyses: usize,
    pub edges: usize,
    /// Whether the edges reached the graph store.
    pub mirrored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl IngestReport {
    fn new(run_id: i64) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            files: 0,
            analyses: 0,
            fallback_analyses: 0,
            edges: 0,
            mirrored: false,
            metrics: None,
            failure: None,
        }
    }
}

/// Create a run and fill it from the collaborators.
///
/// Collaborator failures end the run as `Failed` and are reported, not
/// returned. An analysis failure only affects its own file, which gets a
/// fallback record. Store failures mark the run `Failed` and are returned.
pub fn ingest_run(
    repo: &Repository,
    run: &NewRun,
    discovery: &dyn FileDiscovery,
    generator: &dyn AnalysisGenerator,
    extractor: &dyn DependencyExtractor,
) -> Result<IngestReport> {
    let run_id = repo.create_run(run)?;
    let mut report = IngestReport::new(run_id);

    match populate(repo, &mut report, discovery, generator, extractor) {
        Ok(status) => {
            repo.complete_run(run_id, status, report.failure.as_deref())?;
            report.status = status;
            info!(
                run_id,
                %status,
                files = report.files,
                edges = report.edges,
                "ingest finished"
            );
            Ok(report)
        }
        Err(err) => {
            let note = format!("{err:#}");
            if let Err(seal_err) = repo.complete_run(run_id, RunStatus::Failed, Some(&note)) {
                warn!(run_id, error = %seal_err, "could not mark run failed");
            }
            Err(err.context(format!("ingest run {run_id}")))
        }
    }
}

fn populate(
    repo: &Repository,
    report: &mut IngestReport,
    discovery: &dyn FileDiscovery,
    generator: &dyn AnalysisGenerator,
    extractor: &dyn DependencyExtractor,
) -> Result<RunStatus> {
    let run_id = report.run_id;
    let files = match discovery.discover() {
        Ok(files) => files,
        Err(err) => {
            warn!(run_id, error = %err, "file discovery failed");
            report.failure = Some(format!("discovery: {err}"));
            return Ok(RunStatus::Failed);
        }
    };
    if files.is_empty() {
        return Ok(RunStatus::NoFiles);
    }
    report.files = repo.save_source_files(run_id, &files)?;

    let analyses: Vec<Analysis> = files
        .iter()
        .map(|file| match generator.analyze(file) {
            Ok(mut analysis) => {
                analysis.file_name = file.name.clone();
                analysis
            }
            Err(err) => {
                warn!(run_id, file = %file.name, kind = %err.kind, "analysis failed, storing fallback");
                Analysis::fallback(&file.name, err.to_string())
            }
        })
        .collect();
    report.fallback_analyses = analyses.iter().filter(|a| a.is_fallback()).count();
    report.analyses = repo.save_analyses(run_id, &analyses)?;

    let edges = match extractor.extract(&files) {
        Ok(edges) => edges,
        Err(err) => {
            warn!(run_id, error = %err, "dependency extraction failed");
            report.failure = Some(format!("dependency extraction: {err}"));
            report.metrics = Some(repo.refresh_metrics(run_id)?);
            return Ok(RunStatus::Failed);
        }
    };
    let saved = repo.save_dependencies(run_id, &edges)?;
    report.edges = saved.edges;
    report.mirrored = saved.mirrored;
    report.metrics = Some(repo.refresh_metrics(run_id)?);
    Ok(RunStatus::Completed)
}

#[derive(Debug, Deserialize, Clone)]
pub struct BundleFile {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_copybook: Option<bool>,
}

/// A run serialised as JSON: the file inventory, the analyses (or why they
/// failed), and the extracted edges. Serves as all three collaborators.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunBundle {
    #[serde(default)]
    pub run_id: Option<i64>,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub files: Vec<BundleFile>,
    #[serde(default)]
    pub analyses: Vec<Analysis>,
    /// Analysis failure reason by file name.
    #[serde(default)]
    pub failures: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
}

impl RunBundle {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read bundle {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse bundle {}", path.display()))
    }

    pub fn new_run(&self) -> NewRun {
        NewRun {
            id: self.run_id,
            source_path: self.source_path.clone(),
            output_path: self.output_path.clone(),
            notes: self.notes.clone(),
        }
    }
}

impl FileDiscovery for RunBundle {
    fn discover(&self) -> Result<Vec<SourceFile>, ExternalError> {
        Ok(self
            .files
            .iter()
            .map(|file| {
                let path = file.path.clone().unwrap_or_else(|| file.name.clone());
                let mut source = SourceFile::new(&file.name, path, &file.content);
                if let Some(is_copybook) = file.is_copybook {
                    source.is_copybook = is_copybook;
                }
                source
            })
            .collect())
    }
}

impl AnalysisGenerator for RunBundle {
    fn analyze(&self, file: &SourceFile) -> Result<Analysis, ExternalError> {
        if let Some(reason) = self.failures.get(&file.name) {
            return Err(classify(None, reason));
        }
        self.analyses
            .iter()
            .find(|analysis| analysis.file_name == file.name)
            .cloned()
            .ok_or_else(|| ExternalError::other(format!("bundle has no analysis for {}", file.name)))
    }
}

impl DependencyExtractor for RunBundle {
    fn extract(&self, _files: &[SourceFile]) -> Result<Vec<DependencyEdge>, ExternalError> {
        Ok(self.dependencies.clone())
    }
}
