use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

pub const SCHEMA_VERSION: i64 = 1;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            status TEXT NOT NULL,
            source_path TEXT NOT NULL,
            output_path TEXT NOT NULL,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS source_files (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            is_copybook INTEGER NOT NULL,
            content TEXT NOT NULL,
            line_count INTEGER NOT NULL,
            UNIQUE(run_id, name),
            FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS analyses (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            analysis_text TEXT NOT NULL,
            description TEXT,
            variables TEXT NOT NULL,
            paragraphs TEXT NOT NULL,
            divisions TEXT NOT NULL,
            copybooks TEXT NOT NULL,
            failure TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(run_id, file_name),
            FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS dependencies (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL,
            source_file TEXT NOT NULL,
            target_file TEXT NOT NULL,
            dep_type TEXT NOT NULL,
            line_number INTEGER,
            context TEXT,
            FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_dependencies_run ON dependencies(run_id);
        CREATE INDEX IF NOT EXISTS idx_dependencies_source ON dependencies(run_id, source_file);
        CREATE INDEX IF NOT EXISTS idx_dependencies_target ON dependencies(run_id, target_file);

        CREATE TABLE IF NOT EXISTS file_usage (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            usage_count INTEGER NOT NULL,
            dependent_count INTEGER NOT NULL,
            UNIQUE(run_id, file_name),
            FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS run_metrics (
            run_id INTEGER PRIMARY KEY,
            total_files INTEGER NOT NULL,
            total_programs INTEGER NOT NULL,
            total_copybooks INTEGER NOT NULL,
            total_lines INTEGER NOT NULL,
            total_dependencies INTEGER NOT NULL,
            most_used_file TEXT,
            most_used_count INTEGER NOT NULL,
            circular_count INTEGER NOT NULL,
            circular_summary TEXT,
            insight TEXT NOT NULL,
            diagram TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        );
        COMMIT;
        ",
    )?;

    let current: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|value| value.parse().ok());

    if current != Some(SCHEMA_VERSION) {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION.to_string()],
        )?;
    }
    Ok(())
}
