//! The run state machine
//!
//! A run walks the fixed stage order one step at a time. Every step is a
//! compare-and-set on the run's stage, so duplicate or late transition
//! signals lose the race and do nothing.

use crate::config::PipelineConfig;
use crate::pipeline::fairness::FairnessScheduler;
use crate::pipeline::jobs::{stage_priority, JobContext, JobPayload, CONTROL_PRIORITY};
use crate::pipeline::queue::JobQueue;
use crate::pipeline::queuer::StageJobQueuer;
use crate::pipeline::Stores;
use crate::state::{
    classify_final_status, CrawlState, Run, RunStats, RunStatus, Stage, StageProgressTracker,
};
use crate::{IngestError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a transition request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The run entered `to`, which has `items` units queued
    Advanced { to: Stage, items: usize },
    /// The run reached `completed`; a finalize job is queued
    Finalizing,
    /// The run was not at the expected stage; nothing changed
    Stale { current: Stage },
    Canceled,
}

pub struct StageManager {
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    progress: StageProgressTracker,
    fairness: Arc<FairnessScheduler>,
    queuer: StageJobQueuer,
}

impl StageManager {
    pub fn new(
        stores: Stores,
        queue: Arc<dyn JobQueue>,
        fairness: Arc<FairnessScheduler>,
        config: PipelineConfig,
    ) -> Self {
        let progress = StageProgressTracker::new(stores.kv.clone());
        let queuer = StageJobQueuer::new(stores.clone(), queue.clone(), fairness.clone(), config);
        Self {
            stores,
            queue,
            progress,
            fairness,
            queuer,
        }
    }

    pub fn progress(&self) -> &StageProgressTracker {
        &self.progress
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run> {
        self.stores
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| IngestError::not_found("run", run_id))
    }

    fn control_context(run: &Run) -> JobContext {
        JobContext {
            tenant_id: run.tenant_id.clone(),
            run_id: run.id,
            trace_id: Uuid::new_v4(),
        }
    }

    pub async fn is_run_canceled(&self, run_id: Uuid) -> Result<bool> {
        Ok(self.load_run(run_id).await?.is_canceled())
    }

    /// Moves a pending run to running and queues its discovery job
    ///
    /// # Returns
    ///
    /// `false` if the run had already left `pending`
    pub async fn start_run(&self, run_id: Uuid) -> Result<bool> {
        let run = self.load_run(run_id).await?;
        let started = self
            .stores
            .runs
            .compare_and_set_status(run_id, &[RunStatus::Pending], RunStatus::Running)
            .await?;
        if !started {
            debug!("Run {} is already {}", run_id, run.status);
            return Ok(false);
        }

        info!("Starting run {} of source {}", run_id, run.source_id);
        self.initialize_stage(&run, Stage::Discovering, 1).await?;
        self.queue
            .enqueue(
                JobPayload::Discover {
                    ctx: Self::control_context(&run),
                },
                stage_priority(1),
            )
            .await?;
        Ok(true)
    }

    /// Arms progress tracking for `stage` before any of its work exists
    ///
    /// A stage with no items has nothing to wait for, so the transition out
    /// of it runs inline.
    pub async fn initialize_stage(&self, run: &Run, stage: Stage, item_count: u64) -> Result<()> {
        if self.is_run_canceled(run.id).await? {
            debug!("Not initializing {} of canceled run {}", stage, run.id);
            return Ok(());
        }
        if item_count == 0 {
            info!("Stage {} of run {} is empty, advancing", stage, run.id);
            self.transition_to_next_stage(run.id, stage).await?;
            return Ok(());
        }
        self.progress
            .initialize_stage_progress(run.id, stage, item_count)
            .await?;
        Ok(())
    }

    /// Advances the run past `from`, which has reported complete
    ///
    /// Stages that turn out to have no items are passed through immediately.
    /// Reaching `completed` queues the finalize job.
    pub async fn transition_to_next_stage(
        &self,
        run_id: Uuid,
        from: Stage,
    ) -> Result<TransitionOutcome> {
        let mut from = from;
        loop {
            let run = self.load_run(run_id).await?;
            if run.is_canceled() {
                info!("Run {} is canceled, not leaving {}", run_id, from);
                return Ok(TransitionOutcome::Canceled);
            }

            let entered = if run.stage == from {
                let Some(next) = from.next() else {
                    return Ok(TransitionOutcome::Stale { current: run.stage });
                };
                let moved = self
                    .stores
                    .runs
                    .compare_and_set_stage(run_id, from, next)
                    .await?;
                if !moved {
                    let current = self.load_run(run_id).await?.stage;
                    debug!("Lost transition race of run {} at {}", run_id, from);
                    return Ok(TransitionOutcome::Stale { current });
                }
                info!("Run {} advanced from {} to {}", run_id, from, next);
                if from == Stage::Scraping {
                    self.leave_fairness(run_id).await;
                }
                Run { stage: next, ..run }
            } else if self.needs_resume(&run, from).await? {
                // An earlier attempt moved the stage but failed before its
                // jobs were queued
                warn!("Resuming stage {} of run {}", run.stage, run_id);
                run
            } else {
                debug!(
                    "Ignoring stale transition of run {} from {} (now at {})",
                    run_id, from, run.stage
                );
                return Ok(TransitionOutcome::Stale { current: run.stage });
            };

            match self.enter_stage(entered).await? {
                TransitionOutcome::Advanced { to, items: 0 } => from = to,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Queues the work of the stage the run just entered
    async fn enter_stage(&self, run: Run) -> Result<TransitionOutcome> {
        if run.stage == Stage::Completed {
            self.queue
                .enqueue(
                    JobPayload::Finalize {
                        ctx: Self::control_context(&run),
                    },
                    CONTROL_PRIORITY,
                )
                .await?;
            return Ok(TransitionOutcome::Finalizing);
        }

        let items = self.queuer.queue_stage_jobs(&run, run.stage).await?;
        if items == 0 {
            info!("Stage {} of run {} is empty, advancing", run.stage, run.id);
        }
        Ok(TransitionOutcome::Advanced {
            to: run.stage,
            items,
        })
    }

    /// Whether `run` sits one stage past `from` without its work ever queued
    async fn needs_resume(&self, run: &Run, from: Stage) -> Result<bool> {
        if from.next() != Some(run.stage) {
            return Ok(false);
        }
        if run.stage == Stage::Completed {
            // Finalizing twice is harmless
            return Ok(run.status == RunStatus::Running);
        }
        let progress = self.progress.get_stage_progress(run.id, run.stage).await?;
        Ok(progress.is_none())
    }

    /// Records the outcome of a run that reached `completed`
    ///
    /// Counters are recomputed from the page and chunk records, so increments
    /// lost to redelivery or crashes do not skew the final status. Discovery
    /// and embedding units leave no page behind; their failures are read from
    /// the stage progress before it is released. Only a running run is
    /// finalized; a repeated finalize job does nothing.
    ///
    /// # Returns
    ///
    /// The final status, or `None` if this call did not finalize the run
    pub async fn finalize_run(&self, run_id: Uuid) -> Result<Option<RunStatus>> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running || run.stage != Stage::Completed {
            debug!(
                "Not finalizing run {} ({} at {})",
                run_id, run.status, run.stage
            );
            return Ok(None);
        }

        let pages = self.stores.pages.count_pages(run_id).await?;
        let chunks = self.stores.chunks.count_chunks(run_id).await?;
        let units_failed = self.failed_units(run_id).await?;
        let stats = RunStats {
            pages_seen: pages.total,
            pages_indexed: pages.indexed,
            pages_failed: pages.failed,
            pages_skipped: pages.unchanged,
            chunks_to_embed: chunks.active,
            chunks_embedded: chunks.embedded,
            units_failed,
        };
        self.stores.runs.set_stats(run_id, &stats).await?;

        let status = classify_final_status(&stats);
        let finalized = self
            .stores
            .runs
            .compare_and_set_status(run_id, &[RunStatus::Running], status)
            .await?;
        if !finalized {
            debug!("Run {} was finalized or canceled concurrently", run_id);
            return Ok(None);
        }

        info!(
            "Run {} finished {}: {} indexed, {} failed, {} skipped, {}/{} chunks embedded, {} units failed",
            run_id,
            status,
            stats.pages_indexed,
            stats.pages_failed,
            stats.pages_skipped,
            stats.chunks_embedded,
            stats.chunks_to_embed,
            stats.units_failed
        );
        self.release_run_state(run_id).await;
        Ok(Some(status))
    }

    /// Failed units of the stages whose units are not pages
    async fn failed_units(&self, run_id: Uuid) -> Result<u64> {
        let mut failed = 0;
        for stage in [Stage::Discovering, Stage::Embedding] {
            if let Some(progress) = self.progress.get_stage_progress(run_id, stage).await? {
                failed += progress.failed;
            }
        }
        Ok(failed)
    }

    /// Cancels a pending or running run and releases its ephemeral state
    ///
    /// Jobs already queued still run; each sees the canceled status at its
    /// next check and stops.
    ///
    /// # Returns
    ///
    /// `false` if the run had already finished
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        let canceled = self
            .stores
            .runs
            .compare_and_set_status(
                run_id,
                &[RunStatus::Pending, RunStatus::Running],
                RunStatus::Canceled,
            )
            .await?;
        if !canceled {
            self.load_run(run_id).await?;
            return Ok(false);
        }
        info!("Canceled run {}", run_id);
        self.release_run_state(run_id).await;
        Ok(true)
    }

    /// Stops counting the run in other runs' fetch allowance
    async fn leave_fairness(&self, run_id: Uuid) {
        if let Err(e) = self.fairness.unregister_run(run_id).await {
            warn!("Failed to unregister run {} from fairness: {}", run_id, e);
        }
    }

    /// Drops the crawl state, progress records and slot registration of a run
    ///
    /// Failures are logged and otherwise ignored.
    async fn release_run_state(&self, run_id: Uuid) {
        // The URL cap only matters when admitting
        let crawl = CrawlState::new(self.stores.kv.clone(), run_id, 0);
        if let Err(e) = crawl.cleanup().await {
            warn!("Failed to clean crawl state of run {}: {}", run_id, e);
        }
        if let Err(e) = self.progress.cleanup(run_id).await {
            warn!("Failed to clean progress of run {}: {}", run_id, e);
        }
        self.leave_fairness(run_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FairnessConfig, SourceMode};
    use crate::pipeline::queue::MemoryJobQueue;
    use crate::pipeline::testing::{seed_run, stores};
    use crate::state::PageState;
    use crate::storage::NewChunk;

    struct Harness {
        stores: Stores,
        queue: Arc<MemoryJobQueue>,
        fairness: Arc<FairnessScheduler>,
        manager: StageManager,
    }

    fn harness() -> Harness {
        let stores = stores();
        let queue = Arc::new(MemoryJobQueue::new());
        let fairness = Arc::new(FairnessScheduler::new(
            stores.kv.clone(),
            FairnessConfig::default(),
        ));
        let manager = StageManager::new(
            stores.clone(),
            queue.clone(),
            fairness.clone(),
            PipelineConfig::default(),
        );
        Harness {
            stores,
            queue,
            fairness,
            manager,
        }
    }

    async fn running_run(h: &Harness) -> Run {
        let (_, run) = seed_run(&h.stores, SourceMode::List, &[]).await;
        assert!(h.manager.start_run(run.id).await.unwrap());
        // Drop the discover job so tests see only what they trigger
        h.queue.dequeue().await.unwrap();
        h.stores.runs.get_run(run.id).await.unwrap().unwrap()
    }

    async fn walk_to(h: &Harness, run_id: Uuid, target: Stage) {
        let mut stage = Stage::Discovering;
        while stage != target {
            let next = stage.next().unwrap();
            assert!(h
                .stores
                .runs
                .compare_and_set_stage(run_id, stage, next)
                .await
                .unwrap());
            stage = next;
        }
    }

    async fn page_in_state(h: &Harness, run_id: Uuid, url: &str, state: PageState) {
        let pages = &h.stores.pages;
        match state {
            PageState::Failed => pages.mark_failed(run_id, url, "HTTP 500").await.unwrap(),
            _ => {
                pages.save_fetched(run_id, url, 200, "<p>hi</p>").await.unwrap();
                let hashed = if state == PageState::Unchanged {
                    PageState::Unchanged
                } else {
                    PageState::Extracted
                };
                pages
                    .record_extraction(run_id, url, "hi", "hash", hashed)
                    .await
                    .unwrap();
                if state == PageState::Indexed {
                    pages.mark_indexed(run_id, url).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_start_run_arms_discovery() {
        let h = harness();
        let (_, run) = seed_run(&h.stores, SourceMode::List, &[]).await;

        assert!(h.manager.start_run(run.id).await.unwrap());
        assert!(!h.manager.start_run(run.id).await.unwrap());

        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        let progress = h
            .manager
            .progress()
            .get_stage_progress(run.id, Stage::Discovering)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.total, 1);

        let jobs = h.queue.pending();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.kind(), "discover");
    }

    #[tokio::test]
    async fn test_transition_from_unexpected_stage_is_noop() {
        let h = harness();
        let run = running_run(&h).await;

        let outcome = h
            .manager
            .transition_to_next_stage(run.id, Stage::Indexing)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Stale {
                current: Stage::Discovering
            }
        );
        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stage, Stage::Discovering);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_transition_advances_once() {
        let h = harness();
        let run = running_run(&h).await;
        CrawlState::new(h.stores.kv.clone(), run.id, 10)
            .queue_urls(&["https://example.com/a".into(), "https://example.com/b".into()])
            .await
            .unwrap();

        let first = h
            .manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(
            first,
            TransitionOutcome::Advanced {
                to: Stage::Scraping,
                items: 2
            }
        );

        let second = h
            .manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(
            second,
            TransitionOutcome::Stale {
                current: Stage::Scraping
            }
        );
        assert_eq!(h.queue.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_stages_fast_forward_to_finalize() {
        let h = harness();
        let run = running_run(&h).await;

        let outcome = h
            .manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Finalizing);

        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stage, Stage::Completed);
        let jobs = h.queue.pending();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.kind(), "finalize");
        assert_eq!(jobs[0].priority, CONTROL_PRIORITY);
    }

    #[tokio::test]
    async fn test_initialize_stage_with_no_items_advances_inline() {
        let h = harness();
        let run = running_run(&h).await;

        h.manager
            .initialize_stage(&run, Stage::Discovering, 0)
            .await
            .unwrap();
        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_transition_resumes_stage_left_without_jobs() {
        let h = harness();
        let run = running_run(&h).await;
        CrawlState::new(h.stores.kv.clone(), run.id, 10)
            .queue_urls(&["https://example.com/a".into()])
            .await
            .unwrap();
        // The stage moved but nothing was queued for it
        walk_to(&h, run.id, Stage::Scraping).await;

        let outcome = h
            .manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Advanced {
                to: Stage::Scraping,
                items: 1
            }
        );
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_classifies_and_cleans_up() {
        let h = harness();
        let run = running_run(&h).await;
        for i in 0..7 {
            page_in_state(&h, run.id, &format!("https://example.com/ok/{i}"), PageState::Indexed)
                .await;
        }
        for i in 0..2 {
            page_in_state(&h, run.id, &format!("https://example.com/bad/{i}"), PageState::Failed)
                .await;
        }
        page_in_state(&h, run.id, "https://example.com/same", PageState::Unchanged).await;
        walk_to(&h, run.id, Stage::Completed).await;

        let status = h.manager.finalize_run(run.id).await.unwrap();
        assert_eq!(status, Some(RunStatus::Partial));

        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert!(run.finished_at.is_some());
        assert_eq!(run.stats.pages_seen, 10);
        assert_eq!(run.stats.pages_indexed, 7);
        assert_eq!(run.stats.pages_failed, 2);
        assert_eq!(run.stats.pages_skipped, 1);

        assert!(h
            .manager
            .progress()
            .get_stage_progress(run.id, Stage::Discovering)
            .await
            .unwrap()
            .is_none());

        // A redelivered finalize job changes nothing
        assert_eq!(h.manager.finalize_run(run.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_finalize_all_failed() {
        let h = harness();
        let run = running_run(&h).await;
        for i in 0..3 {
            page_in_state(&h, run.id, &format!("https://example.com/{i}"), PageState::Failed).await;
        }
        walk_to(&h, run.id, Stage::Completed).await;
        assert_eq!(
            h.manager.finalize_run(run.id).await.unwrap(),
            Some(RunStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_failed_discovery_finalizes_failed() {
        let h = harness();
        let run = running_run(&h).await;
        let update = h
            .manager
            .progress()
            .increment_stage_progress(run.id, Stage::Discovering, "discover", true)
            .await
            .unwrap();
        assert!(update.just_completed);

        let outcome = h
            .manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Finalizing);
        assert_eq!(
            h.manager.finalize_run(run.id).await.unwrap(),
            Some(RunStatus::Failed)
        );
        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stats.units_failed, 1);
        assert_eq!(run.stats.pages_seen, 0);
    }

    #[tokio::test]
    async fn test_failed_embedding_is_not_success() {
        let h = harness();
        let run = running_run(&h).await;
        for i in 0..2 {
            let url = format!("https://example.com/{i}");
            page_in_state(&h, run.id, &url, PageState::Indexed).await;
            h.stores
                .chunks
                .replace_chunks(
                    run.id,
                    &url,
                    &[NewChunk {
                        index: 0,
                        content: "hi".into(),
                    }],
                )
                .await
                .unwrap();
        }
        let progress = h.manager.progress();
        progress
            .initialize_stage_progress(run.id, Stage::Embedding, 1)
            .await
            .unwrap();
        progress
            .increment_stage_progress(run.id, Stage::Embedding, "batch-0", true)
            .await
            .unwrap();
        walk_to(&h, run.id, Stage::Completed).await;

        assert_eq!(
            h.manager.finalize_run(run.id).await.unwrap(),
            Some(RunStatus::Partial)
        );
        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stats.pages_indexed, 2);
        assert_eq!(run.stats.chunks_to_embed, 2);
        assert_eq!(run.stats.chunks_embedded, 0);
        assert_eq!(run.stats.units_failed, 1);
    }

    #[tokio::test]
    async fn test_leaving_scraping_releases_fairness_share() {
        let h = harness();
        let run = running_run(&h).await;
        CrawlState::new(h.stores.kv.clone(), run.id, 10)
            .queue_urls(&["https://example.com/a".into()])
            .await
            .unwrap();
        h.manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(h.fairness.active_run_count().await.unwrap(), 1);

        // Nothing was fetched, so processing is empty and the run moves on
        h.manager
            .transition_to_next_stage(run.id, Stage::Scraping)
            .await
            .unwrap();
        assert_eq!(h.fairness.active_run_count().await.unwrap(), 0);
        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_release_clears_crawl_state() {
        let h = harness();
        let run = running_run(&h).await;
        let crawl = CrawlState::new(h.stores.kv.clone(), run.id, 10);
        crawl
            .queue_children("https://example.com/", &["https://example.com/a".into()])
            .await
            .unwrap();

        assert!(h.manager.cancel_run(run.id).await.unwrap());
        assert_eq!(crawl.known_count().await.unwrap(), 0);
        assert!(crawl.get_queued_urls().await.unwrap().is_empty());
        let children = format!("crawl:{}:children:https://example.com/", run.id);
        assert_eq!(h.stores.kv.member_count(&children).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_transitions() {
        let h = harness();
        let run = running_run(&h).await;

        assert!(h.manager.cancel_run(run.id).await.unwrap());
        assert!(h.manager.is_run_canceled(run.id).await.unwrap());
        assert!(!h.manager.cancel_run(run.id).await.unwrap());

        let outcome = h
            .manager
            .transition_to_next_stage(run.id, Stage::Discovering)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Canceled);
        assert_eq!(h.manager.finalize_run(run.id).await.unwrap(), None);

        let run = h.stores.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.stage, Stage::Discovering);
        assert_eq!(run.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let h = harness();
        let err = h
            .manager
            .transition_to_next_stage(Uuid::new_v4(), Stage::Discovering)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound { kind: "run", .. }));
        assert!(!err.is_retryable());
    }
}
