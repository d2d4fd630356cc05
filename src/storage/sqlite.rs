//! SQLite storage implementation
//!
//! One connection behind a mutex serves every durable store trait. Statements
//! are short and never held across an await point.

use crate::config::SourceMode;
use crate::state::{NewRun, PageState, Run, RunStat, RunStats, RunStatus, Source, Stage};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{ChunkStore, PageStore, RunStore, SourceStore};
use crate::storage::{
    ChunkCounts, ChunkRecord, NewChunk, PageCounts, PageRecord, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, source_id, tenant_id, status, stage, pages_seen, pages_indexed,
     pages_failed, pages_skipped, chunks_to_embed, chunks_embedded, units_failed,
     force_reindex, embedding_dimensions, config_hash, created_at, started_at, finished_at, updated_at";

const PAGE_COLUMNS: &str =
    "run_id, url, state, status_code, html, text, content_hash, error, fetched_at, updated_at";

/// SQLite storage backend
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StoreError)` - Failed to open database
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection mutex poisoned".into()))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s}: {e}")))
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s}: {e}")))
}

fn parse_opt_time(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

/// Raw `runs` row, converted outside the rusqlite closure so parse failures
/// surface as [`StoreError::Corrupt`]
struct RunRow {
    id: String,
    source_id: String,
    tenant_id: String,
    status: String,
    stage: String,
    counters: [i64; 7],
    force_reindex: bool,
    embedding_dimensions: Option<i64>,
    config_hash: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            tenant_id: row.get(2)?,
            status: row.get(3)?,
            stage: row.get(4)?,
            counters: [
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
            ],
            force_reindex: row.get(12)?,
            embedding_dimensions: row.get(13)?,
            config_hash: row.get(14)?,
            created_at: row.get(15)?,
            started_at: row.get(16)?,
            finished_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_run(self) -> StoreResult<Run> {
        let status = RunStatus::from_db_string(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown run status {}", self.status)))?;
        let stage = Stage::from_db_string(&self.stage)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown stage {}", self.stage)))?;
        let [seen, indexed, failed, skipped, to_embed, embedded, units_failed] = self.counters;

        Ok(Run {
            id: parse_uuid(&self.id)?,
            source_id: parse_uuid(&self.source_id)?,
            tenant_id: self.tenant_id,
            status,
            stage,
            stats: RunStats {
                pages_seen: seen as u64,
                pages_indexed: indexed as u64,
                pages_failed: failed as u64,
                pages_skipped: skipped as u64,
                chunks_to_embed: to_embed as u64,
                chunks_embedded: embedded as u64,
                units_failed: units_failed as u64,
            },
            force_reindex: self.force_reindex,
            embedding_dimensions: self.embedding_dimensions.map(|d| d as usize),
            config_hash: self.config_hash,
            created_at: parse_time(&self.created_at)?,
            started_at: parse_opt_time(self.started_at)?,
            finished_at: parse_opt_time(self.finished_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

struct PageRow {
    run_id: String,
    url: String,
    state: String,
    status_code: Option<u16>,
    html: Option<String>,
    text: Option<String>,
    content_hash: Option<String>,
    error: Option<String>,
    fetched_at: String,
    updated_at: String,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            url: row.get(1)?,
            state: row.get(2)?,
            status_code: row.get(3)?,
            html: row.get(4)?,
            text: row.get(5)?,
            content_hash: row.get(6)?,
            error: row.get(7)?,
            fetched_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_page(self) -> StoreResult<PageRecord> {
        let state = PageState::from_db_string(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown page state {}", self.state)))?;
        Ok(PageRecord {
            run_id: parse_uuid(&self.run_id)?,
            url: self.url,
            state,
            status_code: self.status_code,
            html: self.html,
            text: self.text,
            content_hash: self.content_hash,
            error: self.error,
            fetched_at: parse_time(&self.fetched_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, new_run: NewRun) -> StoreResult<Run> {
        let id = Uuid::new_v4();
        {
            let conn = self.conn()?;
            let now = now();
            conn.execute(
                "INSERT INTO runs (id, source_id, tenant_id, status, stage, force_reindex,
                 embedding_dimensions, config_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    new_run.source_id.to_string(),
                    new_run.tenant_id,
                    RunStatus::Pending.to_db_string(),
                    Stage::Discovering.to_db_string(),
                    new_run.force_reindex,
                    new_run.embedding_dimensions.map(|d| d as i64),
                    new_run.config_hash,
                    now,
                ],
            )?;
        }
        self.get_run(id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("run {id} vanished after insert")))
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![run_id.to_string()],
                RunRow::from_row,
            )
            .optional()?
        };
        row.map(RunRow::into_run).transpose()
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<Run>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], RunRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn compare_and_set_stage(
        &self,
        run_id: Uuid,
        expected: Stage,
        next: Stage,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET stage = ?1, updated_at = ?2 WHERE id = ?3 AND stage = ?4",
            params![
                next.to_db_string(),
                now(),
                run_id.to_string(),
                expected.to_db_string()
            ],
        )?;
        Ok(updated == 1)
    }

    async fn compare_and_set_status(
        &self,
        run_id: Uuid,
        expected: &[RunStatus],
        next: RunStatus,
    ) -> StoreResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        // Status strings come from the enum, never from input
        let allowed = expected
            .iter()
            .map(|s| format!("'{}'", s.to_db_string()))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE runs SET status = ?1, updated_at = ?2,
                 started_at = CASE WHEN ?3 AND started_at IS NULL THEN ?2 ELSE started_at END,
                 finished_at = CASE WHEN ?4 THEN ?2 ELSE finished_at END
                 WHERE id = ?5 AND status IN ({allowed})"
            ),
            params![
                next.to_db_string(),
                now(),
                next == RunStatus::Running,
                next.is_terminal(),
                run_id.to_string(),
            ],
        )?;
        Ok(updated == 1)
    }

    async fn increment_stat(&self, run_id: Uuid, stat: RunStat, delta: u64) -> StoreResult<()> {
        let column = stat.column();
        let conn = self.conn()?;
        conn.execute(
            &format!("UPDATE runs SET {column} = {column} + ?1, updated_at = ?2 WHERE id = ?3"),
            params![delta as i64, now(), run_id.to_string()],
        )?;
        Ok(())
    }

    async fn set_stats(&self, run_id: Uuid, stats: &RunStats) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE runs SET pages_seen = ?1, pages_indexed = ?2, pages_failed = ?3,
             pages_skipped = ?4, chunks_to_embed = ?5, chunks_embedded = ?6, units_failed = ?7,
             updated_at = ?8 WHERE id = ?9",
            params![
                stats.pages_seen as i64,
                stats.pages_indexed as i64,
                stats.pages_failed as i64,
                stats.pages_skipped as i64,
                stats.chunks_to_embed as i64,
                stats.chunks_embedded as i64,
                stats.units_failed as i64,
                now(),
                run_id.to_string(),
            ],
        )?;
        Ok(())
    }
}

type SourceRow = (String, String, String, String, String, i64, bool, String);

fn source_from_row(row: SourceRow) -> StoreResult<Source> {
    let (id, tenant_id, name, mode, urls, max_urls, respect_robots_txt, allowed_domains) = row;
    let decode = |field: &str, json: &str| -> StoreResult<Vec<String>> {
        serde_json::from_str(json)
            .map_err(|e| StoreError::Corrupt(format!("source {id} {field}: {e}")))
    };
    Ok(Source {
        id: parse_uuid(&id)?,
        tenant_id,
        name,
        mode: SourceMode::parse(&mode)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown source mode {mode}")))?,
        urls: decode("urls", &urls)?,
        max_urls: max_urls as usize,
        respect_robots_txt,
        allowed_domains: decode("allowed_domains", &allowed_domains)?,
    })
}

fn read_source_row(row: &Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

const SOURCE_COLUMNS: &str =
    "id, tenant_id, name, mode, urls, max_urls, respect_robots_txt, allowed_domains";

#[async_trait]
impl SourceStore for SqliteStore {
    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<Source>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"),
                params![source_id.to_string()],
                read_source_row,
            )
            .optional()?
        };
        row.map(source_from_row).transpose()
    }

    async fn find_source(&self, tenant_id: &str, name: &str) -> StoreResult<Option<Source>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE tenant_id = ?1 AND name = ?2"),
                params![tenant_id, name],
                read_source_row,
            )
            .optional()?
        };
        row.map(source_from_row).transpose()
    }

    async fn save_source(&self, source: &Source) -> StoreResult<()> {
        let encode = |list: &Vec<String>| {
            serde_json::to_string(list).map_err(|e| StoreError::Corrupt(e.to_string()))
        };
        let urls = encode(&source.urls)?;
        let allowed_domains = encode(&source.allowed_domains)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sources (id, tenant_id, name, mode, urls, max_urls,
             respect_robots_txt, allowed_domains)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                mode = excluded.mode,
                urls = excluded.urls,
                max_urls = excluded.max_urls,
                respect_robots_txt = excluded.respect_robots_txt,
                allowed_domains = excluded.allowed_domains",
            params![
                source.id.to_string(),
                source.tenant_id,
                source.name,
                source.mode.as_str(),
                urls,
                source.max_urls as i64,
                source.respect_robots_txt,
                allowed_domains,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl PageStore for SqliteStore {
    async fn save_fetched(
        &self,
        run_id: Uuid,
        url: &str,
        status_code: u16,
        html: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pages (run_id, url, state, status_code, html, fetched_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(run_id, url) DO UPDATE SET
                state = excluded.state,
                status_code = excluded.status_code,
                html = excluded.html,
                error = NULL,
                updated_at = excluded.updated_at",
            params![
                run_id.to_string(),
                url,
                PageState::Fetched.to_db_string(),
                status_code,
                html,
                now(),
            ],
        )?;
        Ok(())
    }

    async fn mark_failed(&self, run_id: Uuid, url: &str, error: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pages (run_id, url, state, error, fetched_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(run_id, url) DO UPDATE SET
                state = excluded.state,
                error = excluded.error,
                updated_at = excluded.updated_at",
            params![
                run_id.to_string(),
                url,
                PageState::Failed.to_db_string(),
                error,
                now(),
            ],
        )?;
        Ok(())
    }

    async fn get_page(&self, run_id: Uuid, url: &str) -> StoreResult<Option<PageRecord>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE run_id = ?1 AND url = ?2"),
                params![run_id.to_string(), url],
                PageRow::from_row,
            )
            .optional()?
        };
        row.map(PageRow::into_page).transpose()
    }

    async fn list_urls_in_state(
        &self,
        run_id: Uuid,
        state: PageState,
    ) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT url FROM pages WHERE run_id = ?1 AND state = ?2 ORDER BY id")?;
        let urls = stmt
            .query_map(params![run_id.to_string(), state.to_db_string()], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(urls)
    }

    async fn record_extraction(
        &self,
        run_id: Uuid,
        url: &str,
        text: &str,
        content_hash: &str,
        state: PageState,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pages SET text = ?1, content_hash = ?2, state = ?3, updated_at = ?4
             WHERE run_id = ?5 AND url = ?6",
            params![
                text,
                content_hash,
                state.to_db_string(),
                now(),
                run_id.to_string(),
                url
            ],
        )?;
        Ok(())
    }

    async fn mark_indexed(&self, run_id: Uuid, url: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pages SET state = ?1, updated_at = ?2 WHERE run_id = ?3 AND url = ?4",
            params![
                PageState::Indexed.to_db_string(),
                now(),
                run_id.to_string(),
                url
            ],
        )?;
        Ok(())
    }

    async fn previous_content_hash(
        &self,
        source_id: Uuid,
        url: &str,
        exclude_run: Uuid,
    ) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let hash = conn
            .query_row(
                "SELECT p.content_hash FROM pages p JOIN runs r ON r.id = p.run_id
                 WHERE r.source_id = ?1 AND p.url = ?2 AND p.run_id != ?3
                   AND p.content_hash IS NOT NULL AND p.state IN (?4, ?5)
                 ORDER BY p.updated_at DESC LIMIT 1",
                params![
                    source_id.to_string(),
                    url,
                    exclude_run.to_string(),
                    PageState::Indexed.to_db_string(),
                    PageState::Unchanged.to_db_string(),
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    async fn count_pages(&self, run_id: Uuid) -> StoreResult<PageCounts> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM pages WHERE run_id = ?1 GROUP BY state")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = PageCounts::default();
        for (state, count) in rows {
            let count = count as u64;
            counts.total += count;
            match PageState::from_db_string(&state) {
                Some(PageState::Indexed) => counts.indexed += count,
                Some(PageState::Failed) => counts.failed += count,
                Some(PageState::Unchanged) => counts.unchanged += count,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn replace_chunks(
        &self,
        run_id: Uuid,
        url: &str,
        chunks: &[NewChunk],
    ) -> StoreResult<Vec<ChunkRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE chunks SET deleted = 1 WHERE run_id = ?1 AND url = ?2 AND deleted = 0",
            params![run_id.to_string(), url],
        )?;

        let created_at = now();
        let mut records = Vec::with_capacity(chunks.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, run_id, url, idx, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in chunks {
                let id = Uuid::new_v4();
                stmt.execute(params![
                    id.to_string(),
                    run_id.to_string(),
                    url,
                    chunk.index as i64,
                    chunk.content,
                    created_at,
                ])?;
                records.push(ChunkRecord {
                    id,
                    run_id,
                    url: url.to_string(),
                    index: chunk.index,
                    content: chunk.content.clone(),
                    embedded: false,
                });
            }
        }
        tx.commit()?;
        Ok(records)
    }

    async fn active_chunk_ids(&self, run_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let ids = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM chunks WHERE run_id = ?1 AND deleted = 0 ORDER BY url, idx",
            )?;
            let ids = stmt
                .query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn get_chunks(&self, ids: &[Uuid]) -> StoreResult<Vec<ChunkRecord>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, run_id, url, idx, content, embedded FROM chunks
                 WHERE id = ?1 AND deleted = 0",
            )?;
            let mut rows = Vec::with_capacity(ids.len());
            for id in ids {
                let row = stmt
                    .query_row(params![id.to_string()], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, bool>(5)?,
                        ))
                    })
                    .optional()?;
                rows.extend(row);
            }
            rows
        };

        rows.into_iter()
            .map(|(id, run_id, url, index, content, embedded)| {
                Ok(ChunkRecord {
                    id: parse_uuid(&id)?,
                    run_id: parse_uuid(&run_id)?,
                    url,
                    index: index as usize,
                    content,
                    embedded,
                })
            })
            .collect()
    }

    async fn mark_embedded(&self, ids: &[Uuid]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE chunks SET embedded = 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn count_chunks(&self, run_id: Uuid) -> StoreResult<ChunkCounts> {
        let conn = self.conn()?;
        let (active, embedded): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(embedded), 0) FROM chunks
             WHERE run_id = ?1 AND deleted = 0",
            params![run_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(ChunkCounts {
            active: active as u64,
            embedded: embedded as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_run() -> (SqliteStore, Source, Run) {
        let store = SqliteStore::new_in_memory().unwrap();
        let source = Source {
            id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            name: "docs".into(),
            mode: SourceMode::List,
            urls: vec!["https://example.com/".into()],
            max_urls: 10,
            respect_robots_txt: true,
            allowed_domains: vec![],
        };
        store.save_source(&source).await.unwrap();
        let run = store
            .create_run(NewRun {
                source_id: source.id,
                tenant_id: "acme".into(),
                force_reindex: false,
                embedding_dimensions: Some(8),
                config_hash: None,
            })
            .await
            .unwrap();
        (store, source, run)
    }

    #[tokio::test]
    async fn test_source_roundtrip() {
        let (store, source, _) = store_with_run().await;
        assert_eq!(store.get_source(source.id).await.unwrap(), Some(source.clone()));
        assert_eq!(
            store.find_source("acme", "docs").await.unwrap().map(|s| s.id),
            Some(source.id)
        );
        assert!(store.find_source("other", "docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_run_is_pending_at_discovering() {
        let (store, _, run) = store_with_run().await;
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.stage, Stage::Discovering);
        assert_eq!(run.embedding_dimensions, Some(8));
        assert!(run.started_at.is_none());
        assert!(store.get_run(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_compare_and_set_only_moves_from_expected() {
        let (store, _, run) = store_with_run().await;

        assert!(store
            .compare_and_set_stage(run.id, Stage::Discovering, Stage::Scraping)
            .await
            .unwrap());
        // A duplicate transition signal loses the race
        assert!(!store
            .compare_and_set_stage(run.id, Stage::Discovering, Stage::Scraping)
            .await
            .unwrap());

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stage, Stage::Scraping);
    }

    #[tokio::test]
    async fn test_status_compare_and_set_stamps_timestamps() {
        let (store, _, run) = store_with_run().await;

        assert!(store
            .compare_and_set_status(run.id, &[RunStatus::Pending], RunStatus::Running)
            .await
            .unwrap());
        let running = store.get_run(run.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        assert!(store
            .compare_and_set_status(run.id, &[RunStatus::Running], RunStatus::Partial)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_status(run.id, &[RunStatus::Running], RunStatus::Succeeded)
            .await
            .unwrap());

        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Partial);
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_increment_and_set_stats() {
        let (store, _, run) = store_with_run().await;
        store
            .increment_stat(run.id, RunStat::PagesSeen, 3)
            .await
            .unwrap();
        store
            .increment_stat(run.id, RunStat::PagesSeen, 2)
            .await
            .unwrap();
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().stats.pages_seen,
            5
        );

        let stats = RunStats {
            pages_indexed: 4,
            units_failed: 1,
            ..RunStats::default()
        };
        store.set_stats(run.id, &stats).await.unwrap();
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().stats, stats);
    }

    #[tokio::test]
    async fn test_page_lifecycle_and_counts() {
        let (store, _, run) = store_with_run().await;
        store
            .save_fetched(run.id, "https://example.com/a", 200, "<p>a</p>")
            .await
            .unwrap();
        store
            .save_fetched(run.id, "https://example.com/b", 200, "<p>b</p>")
            .await
            .unwrap();
        store
            .mark_failed(run.id, "https://example.com/c", "HTTP 500")
            .await
            .unwrap();

        assert_eq!(
            store
                .list_urls_in_state(run.id, PageState::Fetched)
                .await
                .unwrap(),
            vec!["https://example.com/a", "https://example.com/b"]
        );

        store
            .record_extraction(run.id, "https://example.com/a", "a", "h1", PageState::Extracted)
            .await
            .unwrap();
        store
            .record_extraction(run.id, "https://example.com/b", "b", "h2", PageState::Unchanged)
            .await
            .unwrap();
        store
            .mark_indexed(run.id, "https://example.com/a")
            .await
            .unwrap();

        let page = store
            .get_page(run.id, "https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.state, PageState::Indexed);
        assert_eq!(page.content_hash.as_deref(), Some("h1"));

        let counts = store.count_pages(run.id).await.unwrap();
        assert_eq!(
            counts,
            PageCounts {
                total: 3,
                indexed: 1,
                failed: 1,
                unchanged: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_previous_content_hash_looks_at_other_runs_of_source() {
        let (store, source, first) = store_with_run().await;
        let url = "https://example.com/a";
        store.save_fetched(first.id, url, 200, "<p>a</p>").await.unwrap();
        store
            .record_extraction(first.id, url, "a", "hash-a", PageState::Extracted)
            .await
            .unwrap();
        store.mark_indexed(first.id, url).await.unwrap();

        let second = store
            .create_run(NewRun {
                source_id: source.id,
                tenant_id: "acme".into(),
                force_reindex: false,
                embedding_dimensions: None,
                config_hash: None,
            })
            .await
            .unwrap();

        assert_eq!(
            store
                .previous_content_hash(source.id, url, second.id)
                .await
                .unwrap()
                .as_deref(),
            Some("hash-a")
        );
        assert_eq!(
            store
                .previous_content_hash(source.id, url, first.id)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_replace_chunks_soft_deletes_previous() {
        let (store, _, run) = store_with_run().await;
        let url = "https://example.com/a";
        let chunks = |n: usize| {
            (0..n)
                .map(|index| NewChunk {
                    index,
                    content: format!("chunk {index}"),
                })
                .collect::<Vec<_>>()
        };

        let first = store.replace_chunks(run.id, url, &chunks(3)).await.unwrap();
        let second = store.replace_chunks(run.id, url, &chunks(2)).await.unwrap();

        let active = store.active_chunk_ids(run.id).await.unwrap();
        assert_eq!(active, second.iter().map(|c| c.id).collect::<Vec<_>>());
        assert!(store.get_chunks(&[first[0].id]).await.unwrap().is_empty());

        store.mark_embedded(&[second[0].id]).await.unwrap();
        assert_eq!(
            store.count_chunks(run.id).await.unwrap(),
            ChunkCounts {
                active: 2,
                embedded: 1,
            }
        );
    }
}
