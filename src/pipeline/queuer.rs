//! Fans a newly active stage out into unit-of-work jobs

use crate::config::PipelineConfig;
use crate::pipeline::fairness::FairnessScheduler;
use crate::pipeline::jobs::{stage_priority, JobContext, JobPayload};
use crate::pipeline::queue::JobQueue;
use crate::pipeline::Stores;
use crate::state::{CrawlState, PageState, Run, Stage, StageProgressTracker};
use crate::{IngestError, Result};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct StageJobQueuer {
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    progress: StageProgressTracker,
    fairness: Arc<FairnessScheduler>,
    config: PipelineConfig,
}

impl StageJobQueuer {
    pub fn new(
        stores: Stores,
        queue: Arc<dyn JobQueue>,
        fairness: Arc<FairnessScheduler>,
        config: PipelineConfig,
    ) -> Self {
        let progress = StageProgressTracker::new(stores.kv.clone());
        Self {
            stores,
            queue,
            progress,
            fairness,
            config,
        }
    }

    /// Queues every job of `stage` for `run`
    ///
    /// Progress is initialized to the item count before the first job is
    /// enqueued. A stage with no items initializes nothing and enqueues
    /// nothing.
    ///
    /// # Returns
    ///
    /// The number of progress units the stage has (embedding counts batches)
    pub async fn queue_stage_jobs(&self, run: &Run, stage: Stage) -> Result<usize> {
        let ctx = JobContext {
            tenant_id: run.tenant_id.clone(),
            run_id: run.id,
            trace_id: Uuid::new_v4(),
        };

        let payloads = self.stage_payloads(run, stage, &ctx).await?;
        if payloads.is_empty() {
            debug!("Stage {} of run {} has no items", stage, run.id);
            return Ok(0);
        }

        if stage == Stage::Scraping {
            self.fairness.register_run(run.id).await?;
        }

        let total = payloads.len();
        self.progress
            .initialize_stage_progress(run.id, stage, total as u64)
            .await?;

        let priority = stage_priority(total);
        let batch_size = self.config.enqueue_batch_size.max(1);
        for batch in payloads.chunks(batch_size) {
            for payload in batch {
                self.queue.enqueue(payload.clone(), priority).await?;
            }
            debug!("Enqueued {} {} jobs for run {}", batch.len(), stage, run.id);
        }

        info!(
            "Queued {} units for stage {} of run {} at priority {}",
            total, stage, run.id, priority
        );
        Ok(total)
    }

    async fn stage_payloads(
        &self,
        run: &Run,
        stage: Stage,
        ctx: &JobContext,
    ) -> Result<Vec<JobPayload>> {
        let payloads = match stage {
            Stage::Discovering => vec![JobPayload::Discover { ctx: ctx.clone() }],
            Stage::Scraping => {
                let source = self
                    .stores
                    .sources
                    .get_source(run.source_id)
                    .await?
                    .ok_or_else(|| IngestError::not_found("source", run.source_id))?;
                CrawlState::new(self.stores.kv.clone(), run.id, source.max_urls)
                    .get_queued_urls()
                    .await?
                    .into_iter()
                    .map(|url| JobPayload::Fetch {
                        ctx: ctx.clone(),
                        url,
                    })
                    .collect()
            }
            Stage::Processing => self
                .stores
                .pages
                .list_urls_in_state(run.id, PageState::Fetched)
                .await?
                .into_iter()
                .map(|url| JobPayload::Process {
                    ctx: ctx.clone(),
                    url,
                })
                .collect(),
            Stage::Indexing => self
                .stores
                .pages
                .list_urls_in_state(run.id, PageState::Extracted)
                .await?
                .into_iter()
                .map(|url| JobPayload::Index {
                    ctx: ctx.clone(),
                    url,
                })
                .collect(),
            Stage::Embedding => self
                .stores
                .chunks
                .active_chunk_ids(run.id)
                .await?
                .chunks(self.config.embed_batch_size.max(1))
                .enumerate()
                .map(|(batch_index, ids)| JobPayload::EmbedBatch {
                    ctx: ctx.clone(),
                    batch_index,
                    chunk_ids: ids.to_vec(),
                })
                .collect(),
            Stage::Completed => Vec::new(),
        };
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FairnessConfig, SourceMode};
    use crate::pipeline::queue::MemoryJobQueue;
    use crate::pipeline::testing::{seed_run, stores};
    use crate::storage::NewChunk;

    fn queuer(stores: &Stores, config: PipelineConfig) -> (StageJobQueuer, Arc<MemoryJobQueue>, Arc<FairnessScheduler>) {
        let queue = Arc::new(MemoryJobQueue::new());
        let fairness = Arc::new(FairnessScheduler::new(
            stores.kv.clone(),
            FairnessConfig::default(),
        ));
        let queuer = StageJobQueuer::new(stores.clone(), queue.clone(), fairness.clone(), config);
        (queuer, queue, fairness)
    }

    #[tokio::test]
    async fn test_empty_stage_enqueues_nothing() {
        let stores = stores();
        let (_, run) = seed_run(&stores, SourceMode::List, &[]).await;
        let (queuer, queue, _) = queuer(&stores, PipelineConfig::default());

        let items = queuer.queue_stage_jobs(&run, Stage::Processing).await.unwrap();
        assert_eq!(items, 0);
        assert!(queue.is_empty());
        let progress = StageProgressTracker::new(stores.kv.clone());
        assert!(progress
            .get_stage_progress(run.id, Stage::Processing)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_scraping_drains_frontier_and_registers_run() {
        let stores = stores();
        let (source, run) = seed_run(&stores, SourceMode::List, &[]).await;
        let frontier: Vec<String> = (0..3).map(|i| format!("https://example.com/{i}")).collect();
        CrawlState::new(stores.kv.clone(), run.id, source.max_urls)
            .queue_urls(&frontier)
            .await
            .unwrap();
        let (queuer, queue, fairness) = queuer(&stores, PipelineConfig::default());

        let items = queuer.queue_stage_jobs(&run, Stage::Scraping).await.unwrap();
        assert_eq!(items, 3);

        let progress = StageProgressTracker::new(stores.kv.clone())
            .get_stage_progress(run.id, Stage::Scraping)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(fairness.active_run_count().await.unwrap(), 1);

        let jobs = queue.pending();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|job| job.priority == stage_priority(3)));
        assert!(jobs
            .iter()
            .all(|job| matches!(&job.payload, JobPayload::Fetch { url, .. } if frontier.contains(url))));
    }

    #[tokio::test]
    async fn test_embedding_progress_counts_batches() {
        let stores = stores();
        let (_, run) = seed_run(&stores, SourceMode::List, &[]).await;
        let chunks: Vec<NewChunk> = (0..5)
            .map(|index| NewChunk {
                index,
                content: format!("chunk {index}"),
            })
            .collect();
        stores
            .pages
            .save_fetched(run.id, "https://example.com/", 200, "<p>x</p>")
            .await
            .unwrap();
        stores
            .chunks
            .replace_chunks(run.id, "https://example.com/", &chunks)
            .await
            .unwrap();

        let config = PipelineConfig {
            embed_batch_size: 2,
            enqueue_batch_size: 1,
            ..PipelineConfig::default()
        };
        let (queuer, queue, _) = queuer(&stores, config);

        assert_eq!(queuer.queue_stage_jobs(&run, Stage::Embedding).await.unwrap(), 3);
        let sizes: Vec<usize> = queue
            .pending()
            .iter()
            .map(|job| match &job.payload {
                JobPayload::EmbedBatch { chunk_ids, .. } => chunk_ids.len(),
                other => panic!("unexpected job {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
