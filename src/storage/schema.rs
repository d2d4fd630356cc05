//! Database schema definitions
//!
//! This module contains the SQL schema for the crawl-ingest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Configured crawl sources
CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    mode TEXT NOT NULL,
    urls TEXT NOT NULL,
    max_urls INTEGER NOT NULL,
    respect_robots_txt INTEGER NOT NULL,
    allowed_domains TEXT NOT NULL,
    UNIQUE(tenant_id, name)
);

-- One row per pipeline run
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id),
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    pages_seen INTEGER NOT NULL DEFAULT 0,
    pages_indexed INTEGER NOT NULL DEFAULT 0,
    pages_failed INTEGER NOT NULL DEFAULT 0,
    pages_skipped INTEGER NOT NULL DEFAULT 0,
    chunks_to_embed INTEGER NOT NULL DEFAULT 0,
    chunks_embedded INTEGER NOT NULL DEFAULT 0,
    units_failed INTEGER NOT NULL DEFAULT 0,
    force_reindex INTEGER NOT NULL DEFAULT 0,
    embedding_dimensions INTEGER,
    config_hash TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_source ON runs(source_id);

-- Pages fetched by a run
CREATE TABLE IF NOT EXISTS pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(id),
    url TEXT NOT NULL,
    state TEXT NOT NULL,
    status_code INTEGER,
    html TEXT,
    text TEXT,
    content_hash TEXT,
    error TEXT,
    fetched_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(run_id, url)
);

CREATE INDEX IF NOT EXISTS idx_pages_run_state ON pages(run_id, state);
CREATE INDEX IF NOT EXISTS idx_pages_url ON pages(url);

-- Text chunks; deleted rows are kept for audit
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    url TEXT NOT NULL,
    idx INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedded INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_run ON chunks(run_id, deleted);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    add_units_failed_column(conn)
}

/// Databases created before `units_failed` existed lack the column
fn add_units_failed_column(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('runs') WHERE name = 'units_failed'",
        [],
        |row| row.get(0),
    )?;
    if present == 0 {
        conn.execute(
            "ALTER TABLE runs ADD COLUMN units_failed INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(initialize_schema(&conn).is_ok());
    }

    #[test]
    fn test_older_runs_table_gains_units_failed() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE runs (id TEXT PRIMARY KEY, source_id TEXT NOT NULL, stage TEXT NOT NULL)",
        )
        .unwrap();
        initialize_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('runs') WHERE name = 'units_failed'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in ["sources", "runs", "pages", "chunks"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }
}
