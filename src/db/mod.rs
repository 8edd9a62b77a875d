use crate::config::Config;
use crate::model::{
    Analysis, DependencyEdge, FileUsage, MetricsSnapshot, NewRun, Run, RunStatus, SourceFile,
};
use anyhow::{Context, Result, bail};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

mod migrations;

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        Ok(())
    }

    fn on_release(&self, _conn: Connection) {}
}

/// Row counts backing a run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub files: i64,
    pub copybooks: i64,
    pub analyses: i64,
    pub fallback_analyses: i64,
    pub dependencies: i64,
}

/// What the file inventory knows about a file, for graph node enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProfile {
    pub is_copybook: bool,
    /// Newline count + 1 over the stored content.
    pub content_lines: i64,
}

/// Relational store of record: runs, file inventory, analyses, the flat
/// dependency edge list and per-run metrics.
pub struct Db {
    db_path: PathBuf,
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl Db {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory {}", parent.display()))?;
        }

        let config = Config::get();
        debug!(
            pool_size = config.pool_size,
            min_idle = config.pool_min_idle,
            "initializing connection pool"
        );

        // Open write connection first and run migrations
        let write_conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db at {}", db_path.display()))?;
        write_conn.busy_timeout(Duration::from_secs(30))?;
        write_conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&write_conn)?;

        let write_conn = Arc::new(Mutex::new(write_conn));

        let manager = SqliteConnectionManager::file(db_path);
        let read_pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(config.pool_min_idle))
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(ConnectionCustomizer))
            .build(manager)
            .with_context(|| "create connection pool")?;

        info!(path = %db_path.display(), "database opened");

        Ok(Self {
            db_path: db_path.to_path_buf(),
            write_conn,
            read_pool,
        })
    }

    /// Get the database file path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn read_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.read_pool
            .get()
            .with_context(|| "get read connection from pool")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.write_conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_run(&self, run: &NewRun) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (id, started_at, completed_at, status, source_path, output_path, notes)
             VALUES (?, ?, NULL, ?, ?, ?, ?)",
            params![
                run.id,
                now(),
                RunStatus::Running.as_str(),
                &run.source_path,
                &run.output_path,
                run.notes.as_deref(),
            ],
        )
        .with_context(|| format!("create run {:?}", run.id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Move a running run to its final status. Notes replace the existing
    /// ones when given.
    pub fn complete_run(&self, run_id: i64, status: RunStatus, notes: Option<&str>) -> Result<()> {
        if status == RunStatus::Running {
            bail!("run {run_id} cannot be completed as Running");
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current = run_status(&tx, run_id)?;
        if current != RunStatus::Running {
            bail!("run {run_id} is already {current}");
        }
        tx.execute(
            "UPDATE runs SET status = ?, completed_at = ?, notes = COALESCE(?, notes) WHERE id = ?",
            params![status.as_str(), now(), notes, run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Notes stay editable after completion.
    pub fn update_notes(&self, run_id: i64, notes: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE runs SET notes = ? WHERE id = ?",
            params![notes, run_id],
        )?;
        if updated == 0 {
            bail!("run {run_id} does not exist");
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        let run = self
            .read_conn()?
            .query_row(
                "SELECT id, started_at, completed_at, status, source_path, output_path, notes
                 FROM runs WHERE id = ?",
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn latest_run(&self) -> Result<Option<Run>> {
        let run = self
            .read_conn()?
            .query_row(
                "SELECT id, started_at, completed_at, status, source_path, output_path, notes
                 FROM runs ORDER BY id DESC LIMIT 1",
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, completed_at, status, source_path, output_path, notes
             FROM runs ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub fn replace_source_files(&self, run_id: i64, files: &[SourceFile]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_writable(&tx, run_id)?;
        tx.execute("DELETE FROM source_files WHERE run_id = ?", params![run_id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO source_files (run_id, name, path, is_copybook, content, line_count)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for file in files {
                insert
                    .execute(params![
                        run_id,
                        &file.name,
                        &file.path,
                        file.is_copybook,
                        &file.content,
                        file.line_count,
                    ])
                    .with_context(|| format!("insert source file {}", file.name))?;
            }
        }
        tx.commit()?;
        Ok(files.len())
    }

    pub fn replace_analyses(&self, run_id: i64, analyses: &[Analysis]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_writable(&tx, run_id)?;
        tx.execute("DELETE FROM analyses WHERE run_id = ?", params![run_id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO analyses
                 (run_id, file_name, analysis_text, description, variables, paragraphs, divisions,
                  copybooks, failure, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let created_at = now();
            for analysis in analyses {
                insert
                    .execute(params![
                        run_id,
                        &analysis.file_name,
                        &analysis.text,
                        analysis.description.as_deref(),
                        serde_json::to_string(&analysis.variables)?,
                        serde_json::to_string(&analysis.paragraphs)?,
                        serde_json::to_string(&analysis.divisions)?,
                        serde_json::to_string(&analysis.copybooks)?,
                        analysis.failure.as_deref(),
                        &created_at,
                    ])
                    .with_context(|| format!("insert analysis for {}", analysis.file_name))?;
            }
        }
        tx.commit()?;
        Ok(analyses.len())
    }

    /// Replace the run's edge list and the usage rows derived from it in a
    /// single transaction.
    pub fn replace_dependencies(&self, run_id: i64, edges: &[DependencyEdge]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_writable(&tx, run_id)?;
        tx.execute("DELETE FROM dependencies WHERE run_id = ?", params![run_id])?;
        tx.execute("DELETE FROM file_usage WHERE run_id = ?", params![run_id])?;
        {
            let mut insert_edge = tx.prepare(
                "INSERT INTO dependencies (run_id, source_file, target_file, dep_type, line_number, context)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for edge in edges {
                insert_edge.execute(params![
                    run_id,
                    &edge.source,
                    &edge.target,
                    edge.kind.as_str(),
                    edge.line,
                    edge.context.as_deref(),
                ])?;
            }
            let mut insert_usage = tx.prepare(
                "INSERT INTO file_usage (run_id, file_name, usage_count, dependent_count)
                 VALUES (?, ?, ?, ?)",
            )?;
            for usage in usage_rows(edges) {
                insert_usage.execute(params![
                    run_id,
                    &usage.file_name,
                    usage.usage_count,
                    usage.dependent_count,
                ])?;
            }
        }
        tx.commit()?;
        debug!(run_id, edges = edges.len(), "dependencies replaced");
        Ok(edges.len())
    }

    pub fn replace_metrics(&self, run_id: i64, metrics: &MetricsSnapshot) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_writable(&tx, run_id)?;
        tx.execute("DELETE FROM run_metrics WHERE run_id = ?", params![run_id])?;
        tx.execute(
            "INSERT INTO run_metrics
             (run_id, total_files, total_programs, total_copybooks, total_lines, total_dependencies,
              most_used_file, most_used_count, circular_count, circular_summary, insight, diagram,
              computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                run_id,
                metrics.total_files,
                metrics.total_programs,
                metrics.total_copybooks,
                metrics.total_lines,
                metrics.total_dependencies,
                metrics.most_used_file.as_deref(),
                metrics.most_used_count,
                metrics.circular_count,
                metrics.circular_summary.as_deref(),
                &metrics.insight,
                &metrics.diagram,
                now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_source_files(&self, run_id: i64) -> Result<Vec<SourceFile>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, path, is_copybook, content, line_count
             FROM source_files WHERE run_id = ? ORDER BY name",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(SourceFile {
                name: row.get(0)?,
                path: row.get(1)?,
                is_copybook: row.get(2)?,
                content: row.get(3)?,
                line_count: row.get(4)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn file_profiles(&self, run_id: i64) -> Result<BTreeMap<String, FileProfile>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, is_copybook,
                    LENGTH(content) - LENGTH(REPLACE(content, char(10), '')) + 1
             FROM source_files WHERE run_id = ?",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                FileProfile {
                    is_copybook: row.get(1)?,
                    content_lines: row.get(2)?,
                },
            ))
        })?;
        let mut profiles = BTreeMap::new();
        for row in rows {
            let (name, profile) = row?;
            profiles.insert(name, profile);
        }
        Ok(profiles)
    }

    pub fn list_analyses(&self, run_id: i64) -> Result<Vec<Analysis>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_name, analysis_text, description, variables, paragraphs, divisions,
                    copybooks, failure
             FROM analyses WHERE run_id = ? ORDER BY file_name",
        )?;
        let rows = stmt.query_map(params![run_id], analysis_from_row)?;
        let mut analyses = Vec::new();
        for row in rows {
            analyses.push(row?);
        }
        Ok(analyses)
    }

    /// Look up a program's analysis by file name; an exact match wins over a
    /// case-insensitive one, which wins over a bare program name (`PAYROLL`
    /// for `PAYROLL.cbl`).
    pub fn get_analysis(&self, run_id: i64, program: &str) -> Result<Option<Analysis>> {
        let stem_pattern = format!("{}.%", escape_like(program));
        let analysis = self
            .read_conn()?
            .query_row(
                "SELECT file_name, analysis_text, description, variables, paragraphs, divisions,
                        copybooks, failure
                 FROM analyses
                 WHERE run_id = ?1
                   AND (file_name = ?2 COLLATE NOCASE OR file_name LIKE ?3 ESCAPE '\\')
                 ORDER BY CASE
                            WHEN file_name = ?2 THEN 0
                            WHEN file_name = ?2 COLLATE NOCASE THEN 1
                            ELSE 2
                          END,
                          file_name
                 LIMIT 1",
                params![run_id, program, stem_pattern],
                analysis_from_row,
            )
            .optional()?;
        Ok(analysis)
    }

    pub fn list_dependencies(&self, run_id: i64) -> Result<Vec<DependencyEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_file, target_file, dep_type, line_number, context
             FROM dependencies WHERE run_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], edge_from_row)?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    pub fn list_usage(&self, run_id: i64) -> Result<Vec<FileUsage>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_name, usage_count, dependent_count
             FROM file_usage WHERE run_id = ?
             ORDER BY usage_count DESC, file_name",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(FileUsage {
                file_name: row.get(0)?,
                usage_count: row.get(1)?,
                dependent_count: row.get(2)?,
            })
        })?;
        let mut usage = Vec::new();
        for row in rows {
            usage.push(row?);
        }
        Ok(usage)
    }

    pub fn get_metrics(&self, run_id: i64) -> Result<Option<MetricsSnapshot>> {
        let metrics = self
            .read_conn()?
            .query_row(
                "SELECT total_files, total_programs, total_copybooks, total_lines,
                        total_dependencies, most_used_file, most_used_count, circular_count,
                        circular_summary, insight, diagram
                 FROM run_metrics WHERE run_id = ?",
                params![run_id],
                |row| {
                    Ok(MetricsSnapshot {
                        total_files: row.get(0)?,
                        total_programs: row.get(1)?,
                        total_copybooks: row.get(2)?,
                        total_lines: row.get(3)?,
                        total_dependencies: row.get(4)?,
                        most_used_file: row.get(5)?,
                        most_used_count: row.get(6)?,
                        circular_count: row.get(7)?,
                        circular_summary: row.get(8)?,
                        insight: row.get(9)?,
                        diagram: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(metrics)
    }

    pub fn run_counts(&self, run_id: i64) -> Result<RunCounts> {
        let counts = self.read_conn()?.query_row(
            "SELECT
                (SELECT COUNT(*) FROM source_files WHERE run_id = ?1),
                (SELECT COUNT(*) FROM source_files WHERE run_id = ?1 AND is_copybook = 1),
                (SELECT COUNT(*) FROM analyses WHERE run_id = ?1),
                (SELECT COUNT(*) FROM analyses WHERE run_id = ?1 AND failure IS NOT NULL),
                (SELECT COUNT(*) FROM dependencies WHERE run_id = ?1)",
            params![run_id],
            |row| {
                Ok(RunCounts {
                    files: row.get(0)?,
                    copybooks: row.get(1)?,
                    analyses: row.get(2)?,
                    fallback_analyses: row.get(3)?,
                    dependencies: row.get(4)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// True when `name` is an endpoint of any of the run's edges.
    pub fn node_exists(&self, run_id: i64, name: &str) -> Result<bool> {
        let exists = self.read_conn()?.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM dependencies
                WHERE run_id = ?1 AND (source_file = ?2 OR target_file = ?2)
             )",
            params![run_id, name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn run_status(tx: &Transaction<'_>, run_id: i64) -> Result<RunStatus> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM runs WHERE id = ?",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        Some(status) => status.parse(),
        None => bail!("run {run_id} does not exist"),
    }
}

fn ensure_writable(tx: &Transaction<'_>, run_id: i64) -> Result<()> {
    let status = run_status(tx, run_id)?;
    if status.is_sealed() {
        bail!("run {run_id} is {status}; its data is read-only");
    }
    Ok(())
}

fn usage_rows(edges: &[DependencyEdge]) -> Vec<FileUsage> {
    let mut by_target: BTreeMap<&str, (i64, BTreeSet<&str>)> = BTreeMap::new();
    for edge in edges {
        let entry = by_target.entry(&edge.target).or_default();
        entry.0 += 1;
        entry.1.insert(&edge.source);
    }
    by_target
        .into_iter()
        .map(|(name, (usage_count, sources))| FileUsage {
            file_name: name.to_string(),
            usage_count,
            dependent_count: sources.len() as i64,
        })
        .collect()
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn conversion_error(idx: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(3)?;
    Ok(Run {
        id: row.get(0)?,
        started_at: row.get(1)?,
        completed_at: row.get(2)?,
        status: status.parse().map_err(|err| conversion_error(3, err))?,
        source_path: row.get(4)?,
        output_path: row.get(5)?,
        notes: row.get(6)?,
    })
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<DependencyEdge> {
    let kind: String = row.get(2)?;
    Ok(DependencyEdge {
        source: row.get(0)?,
        target: row.get(1)?,
        kind: kind.parse().map_err(|err| conversion_error(2, err))?,
        line: row.get(3)?,
        context: row.get(4)?,
    })
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(idx, err.into()))
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<Analysis> {
    Ok(Analysis {
        file_name: row.get(0)?,
        text: row.get(1)?,
        description: row.get(2)?,
        variables: json_list(row, 3)?,
        paragraphs: json_list(row, 4)?,
        divisions: json_list(row, 5)?,
        copybooks: json_list(row, 6)?,
        failure: row.get(7)?,
    })
}
