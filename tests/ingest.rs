use insights::error::{ErrorKind, ExternalError};
use insights::ingest::{
    AnalysisGenerator, DependencyExtractor, FileDiscovery, RunBundle, ingest_run,
};
use insights::model::{Analysis, DependencyEdge, EdgeType, NewRun, RunStatus, SourceFile};
use insights::repository::Repository;
use serde_json::json;
use tempfile::TempDir;

struct Inventory(Vec<SourceFile>);

impl FileDiscovery for Inventory {
    fn discover(&self) -> Result<Vec<SourceFile>, ExternalError> {
        Ok(self.0.clone())
    }
}

struct Offline;

impl FileDiscovery for Offline {
    fn discover(&self) -> Result<Vec<SourceFile>, ExternalError> {
        Err(ExternalError::new(ErrorKind::NetworkUnavailable, "share not mounted"))
    }
}

impl DependencyExtractor for Offline {
    fn extract(&self, _files: &[SourceFile]) -> Result<Vec<DependencyEdge>, ExternalError> {
        Err(ExternalError::other("parser crashed"))
    }
}

/// Describes every file except the ones it is told to reject.
struct Describer {
    reject: &'static [&'static str],
}

impl AnalysisGenerator for Describer {
    fn analyze(&self, file: &SourceFile) -> Result<Analysis, ExternalError> {
        if self.reject.contains(&file.name.as_str()) {
            return Err(ExternalError::new(ErrorKind::Unauthorized, "invalid api key"));
        }
        Ok(Analysis {
            // the stored record is keyed by the file, whatever the generator says
            file_name: "ignored".to_string(),
            text: format!("{} does payroll things", file.name),
            ..Default::default()
        })
    }
}

struct Edges(Vec<DependencyEdge>);

impl DependencyExtractor for Edges {
    fn extract(&self, _files: &[SourceFile]) -> Result<Vec<DependencyEdge>, ExternalError> {
        Ok(self.0.clone())
    }
}

fn inventory() -> Inventory {
    Inventory(vec![
        SourceFile::new("MAIN.cbl", "src/MAIN.cbl", "PROCEDURE DIVISION.\n    CALL 'SUB'.\n"),
        SourceFile::new("SUB.cbl", "src/SUB.cbl", "PROCEDURE DIVISION.\n"),
        SourceFile::new("REC.cpy", "copy/REC.cpy", "01 REC.\n"),
    ])
}

fn edges() -> Edges {
    Edges(vec![
        DependencyEdge::new("MAIN.cbl", "SUB.cbl", EdgeType::Call, Some(2)),
        DependencyEdge::new("MAIN.cbl", "REC.cpy", EdgeType::Copy, Some(1)),
        DependencyEdge::new("SUB.cbl", "REC.cpy", EdgeType::Copy, Some(1)),
    ])
}

fn new_run() -> NewRun {
    NewRun {
        source_path: "/legacy/payroll".to_string(),
        output_path: "/out".to_string(),
        ..Default::default()
    }
}

#[test]
fn failed_analysis_gets_a_fallback_record() {
    let temp = TempDir::new().unwrap();
    let repo = Repository::open(&temp.path().join("insights.sqlite"), None).unwrap();
    let report = ingest_run(
        &repo,
        &new_run(),
        &inventory(),
        &Describer { reject: &["SUB.cbl"] },
        &edges(),
    )
    .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.files, 3);
    assert_eq!(report.analyses, 3);
    assert_eq!(report.fallback_analyses, 1);
    assert_eq!(report.edges, 3);
    assert!(!report.mirrored);
    let metrics = report.metrics.unwrap();
    assert_eq!(metrics.most_used_file.as_deref(), Some("REC.cpy"));
    assert_eq!(metrics.circular_count, 0);

    let analyses = repo.list_analyses(report.run_id).unwrap();
    assert_eq!(analyses.len(), 3);
    let sub = repo.get_analysis(report.run_id, "SUB").unwrap().unwrap();
    assert!(sub.is_fallback());
    assert!(sub.failure.unwrap().contains("unauthorized"));
    let main = repo.get_analysis(report.run_id, "MAIN.cbl").unwrap().unwrap();
    assert_eq!(main.file_name, "MAIN.cbl");

    let run = repo.get_run(report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
}

#[test]
fn empty_discovery_ends_as_no_files() {
    let temp = TempDir::new().unwrap();
    let repo = Repository::open(&temp.path().join("insights.sqlite"), None).unwrap();
    let report = ingest_run(
        &repo,
        &new_run(),
        &Inventory(Vec::new()),
        &Describer { reject: &[] },
        &edges(),
    )
    .unwrap();
    assert_eq!(report.status, RunStatus::NoFiles);
    assert_eq!(report.edges, 0);
    assert_eq!(
        repo.get_run(report.run_id).unwrap().unwrap().status,
        RunStatus::NoFiles
    );
    assert!(repo.dependency_map(report.run_id).unwrap().edges.is_empty());
}

#[test]
fn discovery_failure_ends_as_failed() {
    let temp = TempDir::new().unwrap();
    let repo = Repository::open(&temp.path().join("insights.sqlite"), None).unwrap();
    let report = ingest_run(
        &repo,
        &new_run(),
        &Offline,
        &Describer { reject: &[] },
        &edges(),
    )
    .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.failure.as_deref().unwrap().contains("share not mounted"));
    let run = repo.get_run(report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.notes.unwrap().starts_with("discovery:"));
}

#[test]
fn extraction_failure_keeps_files_and_analyses() {
    let temp = TempDir::new().unwrap();
    let repo = Repository::open(&temp.path().join("insights.sqlite"), None).unwrap();
    let report = ingest_run(
        &repo,
        &new_run(),
        &inventory(),
        &Describer { reject: &[] },
        &Offline,
    )
    .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.files, 3);
    assert_eq!(report.analyses, 3);
    assert_eq!(report.metrics.unwrap().total_dependencies, 0);

    let summary = repo.summary(report.run_id).unwrap().unwrap();
    assert_eq!(summary.file_count, 3);
    assert_eq!(summary.copybook_count, 1);
    assert_eq!(summary.dependency_count, 0);
    // sealed
    assert!(repo.save_dependencies(report.run_id, &edges().0).is_err());
}

#[test]
fn edges_reach_the_graph_store_when_configured() {
    let temp = TempDir::new().unwrap();
    let repo = Repository::open(
        &temp.path().join("insights.sqlite"),
        Some(&temp.path().join("graph.sqlite")),
    )
    .unwrap();
    let report = ingest_run(
        &repo,
        &new_run(),
        &inventory(),
        &Describer { reject: &[] },
        &edges(),
    )
    .unwrap();
    assert!(report.mirrored);

    let graph = repo.graph(report.run_id).unwrap();
    assert!(graph.ranked);
    let rec = graph.nodes.iter().find(|n| n.name == "REC.cpy").unwrap();
    assert!(rec.is_copybook);
    assert_eq!(rec.line_count, Some(2));
    assert_eq!(rec.rank.map(|r| (r.incoming, r.outgoing)), Some((2, 0)));
}

#[test]
fn bundle_file_drives_a_whole_run() {
    let temp = TempDir::new().unwrap();
    let bundle_path = temp.path().join("run-7.json");
    std::fs::write(
        &bundle_path,
        serde_json::to_string(&json!({
            "run_id": 7,
            "source_path": "/legacy/billing",
            "notes": "weekly",
            "files": [
                { "name": "BILL.cbl", "path": "src/BILL.cbl", "content": "CALL 'RATE'.\nCALL 'BILL'.\n" },
                { "name": "RATE.cbl", "content": "CALL 'BILL'.\n" },
                { "name": "ACCT", "is_copybook": true },
            ],
            "analyses": [
                { "file_name": "BILL.cbl", "text": "Produces invoices", "paragraphs": ["MAIN"] },
                { "file_name": "RATE.cbl", "text": "Looks up tariffs" },
            ],
            "failures": { "ACCT": "connection refused" },
            "dependencies": [
                { "source": "BILL.cbl", "target": "RATE.cbl", "type": "CALL", "line": 1 },
                { "source": "RATE.cbl", "target": "BILL.cbl", "type": "CALL", "line": 1 },
                { "source": "BILL.cbl", "target": "ACCT", "type": "COPY" },
            ],
        }))
        .unwrap(),
    )
    .unwrap();

    let bundle = RunBundle::from_path(&bundle_path).unwrap();
    let repo = Repository::open(&temp.path().join("insights.sqlite"), None).unwrap();
    let report = ingest_run(&repo, &bundle.new_run(), &bundle, &bundle, &bundle).unwrap();

    assert_eq!(report.run_id, 7);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.fallback_analyses, 1);
    assert_eq!(report.metrics.as_ref().unwrap().circular_count, 1);

    let acct = repo.get_analysis(7, "ACCT").unwrap().unwrap();
    assert!(acct.failure.unwrap().contains("connection refused"));
    let cycles = repo.cycles(7).unwrap();
    assert_eq!(cycles.cycles[0].path, vec!["BILL.cbl", "RATE.cbl"]);
    assert_eq!(
        repo.get_run(7).unwrap().unwrap().notes.as_deref(),
        Some("weekly")
    );
}

#[test]
fn missing_bundle_is_an_error() {
    let temp = TempDir::new().unwrap();
    let err = RunBundle::from_path(&temp.path().join("absent.json")).unwrap_err();
    assert!(format!("{err:#}").contains("absent.json"));
}
