//! Durable store interfaces
//!
//! The pipeline only ever talks to storage through these traits, so the
//! SQLite backend can be swapped for a networked database without touching
//! the stage machinery.

use crate::state::{NewRun, PageState, Run, RunStat, RunStats, RunStatus, Source, Stage};
use crate::storage::{ChunkCounts, ChunkRecord, NewChunk, PageCounts, PageRecord, StoreResult};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a run in `pending` status at the first stage
    async fn create_run(&self, new_run: NewRun) -> StoreResult<Run>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<Run>>;

    /// Moves the run from `expected` to `next`
    ///
    /// # Returns
    ///
    /// `true` if this call performed the move, `false` if the run was no
    /// longer at `expected` (or does not exist)
    async fn compare_and_set_stage(
        &self,
        run_id: Uuid,
        expected: Stage,
        next: Stage,
    ) -> StoreResult<bool>;

    /// Moves the run's status to `next` if it is currently one of `expected`
    ///
    /// Entering `running` stamps `started_at`; entering a terminal status
    /// stamps `finished_at`.
    async fn compare_and_set_status(
        &self,
        run_id: Uuid,
        expected: &[RunStatus],
        next: RunStatus,
    ) -> StoreResult<bool>;

    async fn increment_stat(&self, run_id: Uuid, stat: RunStat, delta: u64) -> StoreResult<()>;

    /// Overwrites every counter, used when finalization recomputes them
    async fn set_stats(&self, run_id: Uuid, stats: &RunStats) -> StoreResult<()>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<Source>>;

    async fn find_source(&self, tenant_id: &str, name: &str) -> StoreResult<Option<Source>>;

    /// Inserts the source or replaces the stored copy with the same id
    async fn save_source(&self, source: &Source) -> StoreResult<()>;
}

#[async_trait]
pub trait PageStore: Send + Sync {
    /// Stores fetched HTML for `url` in state `fetched`, replacing any prior attempt
    async fn save_fetched(
        &self,
        run_id: Uuid,
        url: &str,
        status_code: u16,
        html: &str,
    ) -> StoreResult<()>;

    /// Records a page that could not be fetched or processed
    async fn mark_failed(&self, run_id: Uuid, url: &str, error: &str) -> StoreResult<()>;

    async fn get_page(&self, run_id: Uuid, url: &str) -> StoreResult<Option<PageRecord>>;

    /// URLs of the run's pages in `state`, in fetch order
    async fn list_urls_in_state(&self, run_id: Uuid, state: PageState)
        -> StoreResult<Vec<String>>;

    /// Records extracted text and its hash; `state` is `extracted` or `unchanged`
    async fn record_extraction(
        &self,
        run_id: Uuid,
        url: &str,
        text: &str,
        content_hash: &str,
        state: PageState,
    ) -> StoreResult<()>;

    async fn mark_indexed(&self, run_id: Uuid, url: &str) -> StoreResult<()>;

    /// Content hash recorded for `url` by the source's latest other run
    async fn previous_content_hash(
        &self,
        source_id: Uuid,
        url: &str,
        exclude_run: Uuid,
    ) -> StoreResult<Option<String>>;

    async fn count_pages(&self, run_id: Uuid) -> StoreResult<PageCounts>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Soft-deletes the run's existing chunks for `url` and inserts `chunks`
    async fn replace_chunks(
        &self,
        run_id: Uuid,
        url: &str,
        chunks: &[NewChunk],
    ) -> StoreResult<Vec<ChunkRecord>>;

    /// Ids of the run's live chunks, ordered by URL then index
    async fn active_chunk_ids(&self, run_id: Uuid) -> StoreResult<Vec<Uuid>>;

    /// Live chunks among `ids`; missing or deleted ids are left out
    async fn get_chunks(&self, ids: &[Uuid]) -> StoreResult<Vec<ChunkRecord>>;

    async fn mark_embedded(&self, ids: &[Uuid]) -> StoreResult<()>;

    async fn count_chunks(&self, run_id: Uuid) -> StoreResult<ChunkCounts>;
}
