//! Optional graph-capable store.
//!
//! Materialises each run's files as nodes and its dependency edges as
//! relationships in a separate SQLite database, and answers traversal and
//! ranking queries with SQL (recursive CTEs for reachability). The relational
//! store stays authoritative; everything here can be rebuilt from it.

use crate::analytics::{CriticalFile, CriticalReport, Direction, Reach};
use crate::model::{GraphEdge, GraphNode, GraphOrigin, NodeRank, RunGraph};
use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Graph-shaped queries a secondary store can answer for a run.
///
/// The repository holds this as `Option<Box<dyn GraphBackend>>`; a missing
/// backend is a normal configuration, not an error.
pub trait GraphBackend {
    fn name(&self) -> &str;

    /// Replace everything stored for `run_id` with the given nodes and edges.
    fn replace_run(&self, run_id: i64, nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<()>;

    /// Forget the run entirely, so reads fall back to the relational store.
    fn clear_run(&self, run_id: i64) -> Result<()>;

    /// Whether the store holds any node for the run.
    fn has_run(&self, run_id: i64) -> Result<bool>;

    fn load_graph(&self, run_id: i64) -> Result<RunGraph>;

    fn contains(&self, run_id: i64, name: &str) -> Result<bool>;

    fn critical_files(&self, run_id: i64, limit: usize) -> Result<CriticalReport>;

    /// Files reachable from `start` within `max_depth` hops, at minimal distance.
    fn reachable(
        &self,
        run_id: i64,
        start: &str,
        direction: Direction,
        max_depth: usize,
    ) -> Result<Reach>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS graph_nodes (
        run_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        is_copybook INTEGER NOT NULL,
        line_count INTEGER,
        PRIMARY KEY (run_id, name)
    );

    CREATE TABLE IF NOT EXISTS graph_edges (
        run_id INTEGER NOT NULL,
        source TEXT NOT NULL,
        target TEXT NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_edges_identity
        ON graph_edges(run_id, source, target, kind, IFNULL(line, -1));
    CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(run_id, source);
    CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(run_id, target);
";

const FORWARD_REACH: &str = "
    WITH RECURSIVE reach(name, depth) AS (
        SELECT ?2, 0
        UNION
        SELECT e.target, r.depth + 1
        FROM reach r
        JOIN graph_edges e ON e.run_id = ?1 AND e.source = r.name
        WHERE r.depth < ?3
    )
    SELECT name, MIN(depth) FROM reach WHERE name <> ?2 GROUP BY name
";

const REVERSE_REACH: &str = "
    WITH RECURSIVE reach(name, depth) AS (
        SELECT ?2, 0
        UNION
        SELECT e.source, r.depth + 1
        FROM reach r
        JOIN graph_edges e ON e.run_id = ?1 AND e.target = r.name
        WHERE r.depth < ?3
    )
    SELECT name, MIN(depth) FROM reach WHERE name <> ?2 GROUP BY name
";

pub struct GraphStore {
    conn: Mutex<Connection>,
}

impl GraphStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create graph db directory {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open graph db at {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.execute_batch(SCHEMA)
            .with_context(|| "create graph schema")?;
        info!(path = %db_path.display(), "graph store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl GraphBackend for GraphStore {
    fn name(&self) -> &str {
        "sqlite graph store"
    }

    fn replace_run(&self, run_id: i64, nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM graph_edges WHERE run_id = ?", params![run_id])?;
        tx.execute("DELETE FROM graph_nodes WHERE run_id = ?", params![run_id])?;
        {
            let mut insert_node = tx.prepare(
                "INSERT OR REPLACE INTO graph_nodes (run_id, name, is_copybook, line_count)
                 VALUES (?, ?, ?, ?)",
            )?;
            for node in nodes {
                insert_node.execute(params![run_id, &node.name, node.is_copybook, node.line_count])?;
            }
            let mut insert_edge = tx.prepare(
                "INSERT OR IGNORE INTO graph_edges (run_id, source, target, kind, line)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            for edge in edges {
                insert_edge.execute(params![
                    run_id,
                    &edge.source,
                    &edge.target,
                    edge.kind.as_str(),
                    edge.line,
                ])?;
            }
        }
        tx.commit()?;
        debug!(run_id, nodes = nodes.len(), edges = edges.len(), "graph mirrored");
        Ok(())
    }

    fn clear_run(&self, run_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM graph_edges WHERE run_id = ?", params![run_id])?;
        tx.execute("DELETE FROM graph_nodes WHERE run_id = ?", params![run_id])?;
        tx.commit()?;
        debug!(run_id, "graph run cleared");
        Ok(())
    }

    fn has_run(&self, run_id: i64) -> Result<bool> {
        let exists = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM graph_nodes WHERE run_id = ?)",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn load_graph(&self, run_id: i64) -> Result<RunGraph> {
        let conn = self.conn();
        let mut nodes = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT n.name, n.is_copybook, n.line_count,
                        (SELECT COUNT(*) FROM graph_edges e
                         WHERE e.run_id = n.run_id AND e.target = n.name),
                        (SELECT COUNT(*) FROM graph_edges e
                         WHERE e.run_id = n.run_id AND e.source = n.name)
                 FROM graph_nodes n
                 WHERE n.run_id = ? ORDER BY n.name",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                let incoming: i64 = row.get(3)?;
                let outgoing: i64 = row.get(4)?;
                Ok(GraphNode {
                    name: row.get(0)?,
                    is_copybook: row.get(1)?,
                    line_count: row.get(2)?,
                    rank: Some(NodeRank {
                        incoming: incoming as usize,
                        outgoing: outgoing as usize,
                        score: (incoming + outgoing) as usize,
                    }),
                })
            })?;
            for row in rows {
                nodes.push(row?);
            }
        }
        let mut edges = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT source, target, kind, line FROM graph_edges
                 WHERE run_id = ? ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                let kind: String = row.get(2)?;
                Ok(GraphEdge {
                    source: row.get(0)?,
                    target: row.get(1)?,
                    kind: kind.parse().map_err(|err: anyhow::Error| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, err.into())
                    })?,
                    line: row.get(3)?,
                })
            })?;
            for row in rows {
                edges.push(row?);
            }
        }
        Ok(RunGraph {
            run_id,
            origin: GraphOrigin::GraphStore,
            ranked: true,
            nodes,
            edges,
        })
    }

    fn contains(&self, run_id: i64, name: &str) -> Result<bool> {
        let exists = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM graph_nodes WHERE run_id = ? AND name = ?)",
            params![run_id, name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn critical_files(&self, run_id: i64, limit: usize) -> Result<CriticalReport> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT n.name,
                    (SELECT COUNT(*) FROM graph_edges e
                     WHERE e.run_id = n.run_id AND e.target = n.name) AS incoming,
                    (SELECT COUNT(*) FROM graph_edges e
                     WHERE e.run_id = n.run_id AND e.source = n.name) AS outgoing
             FROM graph_nodes n
             WHERE n.run_id = ?1
             ORDER BY incoming + outgoing DESC, n.name
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            let incoming: i64 = row.get(1)?;
            let outgoing: i64 = row.get(2)?;
            Ok(CriticalFile {
                name: row.get(0)?,
                incoming: incoming as usize,
                outgoing: outgoing as usize,
                score: (incoming + outgoing) as usize,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(CriticalReport { files, limit })
    }

    fn reachable(
        &self,
        run_id: i64,
        start: &str,
        direction: Direction,
        max_depth: usize,
    ) -> Result<Reach> {
        let sql = match direction {
            Direction::Downstream => REVERSE_REACH,
            Direction::Upstream => FORWARD_REACH,
        };
        // one hop past the cap so truncation shows up
        let horizon = max_depth.saturating_add(1) as i64;
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![run_id, start, horizon], |row| {
            let distance: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, distance as usize))
        })?;
        let mut distances = Vec::new();
        for row in rows {
            distances.push(row?);
        }
        Ok(Reach::from_distances(distances, max_depth))
    }
}
