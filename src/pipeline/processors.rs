//! Per-kind job handlers
//!
//! Every unit job ends by reporting its unit to the progress tracker. The
//! report that completes a stage queues the stage transition, so stage N+1 is
//! never queued while a unit of stage N is still outstanding.

use crate::config::{PipelineConfig, SourceMode};
use crate::crawler::{fetch_text, fetch_url, parse_html, parse_sitemap, FetchResult};
use crate::pipeline::chunking::chunk_text;
use crate::pipeline::embed::{Embedder, VectorRecord, VectorStore};
use crate::pipeline::fairness::FairnessScheduler;
use crate::pipeline::jobs::{Job, JobContext, JobPayload, CONTROL_PRIORITY};
use crate::pipeline::manager::StageManager;
use crate::pipeline::queue::JobQueue;
use crate::pipeline::Stores;
use crate::robots::RobotsEngine;
use crate::state::{
    CrawlMetadata, CrawlState, PageState, Run, RunStat, RunStatus, Source, Stage,
    StageProgressTracker,
};
use crate::storage::NewChunk;
use crate::url::{normalize_url, origin_of, SiteScope};
use crate::{IngestError, Result, UrlError};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Upper bound on sitemap documents read per discovery
const MAX_SITEMAPS: usize = 50;

/// How a job attempt ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// The job could not start yet; run it again after the delay without
    /// spending an attempt
    Deferred(Duration),
}

pub struct JobProcessor {
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    progress: StageProgressTracker,
    fairness: Arc<FairnessScheduler>,
    manager: Arc<StageManager>,
    robots: Arc<RobotsEngine>,
    client: Client,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<dyn VectorStore>>,
    config: PipelineConfig,
    /// Last fetch start per origin, for robots.txt crawl delays
    last_fetch: DashMap<String, Instant>,
}

impl JobProcessor {
    pub fn new(
        stores: Stores,
        queue: Arc<dyn JobQueue>,
        fairness: Arc<FairnessScheduler>,
        robots: Arc<RobotsEngine>,
        client: Client,
        config: PipelineConfig,
    ) -> Self {
        let manager = Arc::new(StageManager::new(
            stores.clone(),
            queue.clone(),
            fairness.clone(),
            config.clone(),
        ));
        Self {
            progress: StageProgressTracker::new(stores.kv.clone()),
            stores,
            queue,
            fairness,
            manager,
            robots,
            client,
            embedder: None,
            vectors: None,
            config,
            last_fetch: DashMap::new(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_vector_store(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn manager(&self) -> Arc<StageManager> {
        self.manager.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one attempt of `job`
    ///
    /// Errors are for the worker to classify: retryable ones are attempted
    /// again, the rest end the job through [`JobProcessor::record_exhausted`].
    pub async fn process(&self, job: &Job) -> Result<JobOutcome> {
        let ctx = job.payload.context();
        match &job.payload {
            JobPayload::StageTransition { from, .. } => {
                self.manager
                    .transition_to_next_stage(ctx.run_id, *from)
                    .await?;
                return Ok(JobOutcome::Done);
            }
            JobPayload::Finalize { .. } => {
                self.manager.finalize_run(ctx.run_id).await?;
                return Ok(JobOutcome::Done);
            }
            _ => {}
        }

        let run = self.load_run(ctx.run_id).await?;
        if run.status != RunStatus::Running {
            debug!(
                "Skipping {} job of run {}: run is {}",
                job.payload.kind(),
                run.id,
                run.status
            );
            return Ok(JobOutcome::Done);
        }

        match &job.payload {
            JobPayload::Discover { .. } => self.discover(ctx, &run).await,
            JobPayload::Fetch { url, .. } => self.fetch(ctx, &run, url, job.priority).await,
            JobPayload::Process { url, .. } => self.process_page(ctx, &run, url).await,
            JobPayload::Index { url, .. } => self.index_page(ctx, &run, url).await,
            JobPayload::EmbedBatch {
                batch_index,
                chunk_ids,
                ..
            } => self.embed_batch(ctx, &run, *batch_index, chunk_ids).await,
            JobPayload::StageTransition { .. } | JobPayload::Finalize { .. } => {
                Ok(JobOutcome::Done)
            }
        }
    }

    /// Gives up on a job that failed for good
    ///
    /// Unit jobs count as failed units so their stage still completes; pages
    /// they were working on are marked failed.
    pub async fn record_exhausted(&self, job: &Job, cause: &IngestError) -> Result<()> {
        let ctx = job.payload.context();
        let Some((stage, unit)) = job.payload.progress_unit() else {
            error!(
                "Giving up on {} job of run {}: {}",
                job.payload.kind(),
                ctx.run_id,
                cause
            );
            return Ok(());
        };
        error!(
            "Giving up on {} of run {} after {} attempts: {}",
            unit,
            ctx.run_id,
            job.attempts + 1,
            cause
        );

        match &job.payload {
            JobPayload::Fetch { url, .. }
            | JobPayload::Process { url, .. }
            | JobPayload::Index { url, .. } => {
                self.stores
                    .pages
                    .mark_failed(ctx.run_id, url, &cause.to_string())
                    .await?;
                if matches!(job.payload, JobPayload::Fetch { .. }) {
                    self.crawl_state(ctx.run_id, 0).mark_failed(url).await?;
                }
            }
            _ => {}
        }
        self.report(ctx, stage, &unit, true).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run> {
        self.stores
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| IngestError::not_found("run", run_id))
    }

    async fn load_source(&self, run: &Run) -> Result<Source> {
        self.stores
            .sources
            .get_source(run.source_id)
            .await?
            .ok_or_else(|| IngestError::not_found("source", run.source_id))
    }

    fn crawl_state(&self, run_id: Uuid, max_urls: usize) -> CrawlState {
        CrawlState::new(self.stores.kv.clone(), run_id, max_urls)
    }

    /// Counts one unit and queues the stage transition if it completed the stage
    async fn report(&self, ctx: &JobContext, stage: Stage, unit: &str, failed: bool) -> Result<()> {
        let update = self
            .progress
            .increment_stage_progress(ctx.run_id, stage, unit, failed)
            .await?;
        let progress = update.progress;
        debug!(
            "{} of run {}: {}/{} done, {} failed",
            stage, ctx.run_id, progress.completed, progress.total, progress.failed
        );

        // A redelivered final report re-sends the transition in case the
        // first send was lost; the manager ignores the extra one
        if update.just_completed || (update.duplicate && progress.is_complete()) {
            if update.just_completed {
                info!(
                    "Stage {} of run {} complete: {} ok, {} failed",
                    stage, ctx.run_id, progress.completed, progress.failed
                );
            }
            self.queue
                .enqueue(
                    JobPayload::StageTransition {
                        ctx: ctx.clone(),
                        from: stage,
                    },
                    CONTROL_PRIORITY,
                )
                .await?;
        }
        Ok(())
    }

    async fn discover(&self, ctx: &JobContext, run: &Run) -> Result<JobOutcome> {
        let source = self.load_source(run).await?;
        let candidates = match source.mode {
            SourceMode::List | SourceMode::Domain => source.urls.clone(),
            SourceMode::Sitemap => self.sitemap_urls(&source).await?,
        };

        let mut seen = HashSet::new();
        let normalized: Vec<String> = candidates
            .iter()
            .filter_map(|url| match normalize_url(url) {
                Ok(url) => Some(url.to_string()),
                Err(e) => {
                    debug!("Dropping {}: {}", url, e);
                    None
                }
            })
            .filter(|url| seen.insert(url.clone()))
            .collect();

        let filtered = self
            .robots
            .filter_urls_by_robots_rules(&normalized, source.respect_robots_txt)
            .await;
        for blocked in &filtered.blocked {
            debug!(
                "Blocked {} ({}{})",
                blocked.url,
                blocked.reason,
                blocked
                    .matched_rule
                    .as_deref()
                    .map(|rule| format!(", {rule}"))
                    .unwrap_or_default()
            );
        }

        let crawl = self.crawl_state(run.id, source.max_urls);
        crawl
            .set_metadata(&CrawlMetadata {
                source_id: source.id,
                tenant_id: source.tenant_id.clone(),
                mode: source.mode,
                max_urls: source.max_urls,
                started_at: Utc::now(),
            })
            .await?;
        let admitted = crawl.queue_urls(&filtered.allowed).await?;

        info!(
            "Discovered {} URLs for run {} ({} blocked, {} robots.txt lookups)",
            admitted.len(),
            run.id,
            filtered.blocked.len(),
            filtered.domains_fetched
        );
        self.report(ctx, Stage::Discovering, "discover", false).await?;
        Ok(JobOutcome::Done)
    }

    /// Page URLs listed by the source's sitemaps
    ///
    /// Configured `.xml` URLs are read as sitemaps. Any other URL contributes
    /// the sitemaps its origin's robots.txt names, or `/sitemap.xml` when it
    /// names none. Sitemap indexes are followed.
    async fn sitemap_urls(&self, source: &Source) -> Result<Vec<String>> {
        let mut pending: Vec<String> = Vec::new();
        for url in &source.urls {
            let parsed = Url::parse(url).map_err(|e| UrlError::Parse(e.to_string()))?;
            if parsed.path().ends_with(".xml") {
                pending.push(url.clone());
                continue;
            }
            let Some(origin) = origin_of(&parsed) else {
                return Err(UrlError::MissingDomain.into());
            };
            let listed = self.robots.sitemaps(&origin).await;
            if listed.is_empty() {
                pending.push(format!("{origin}/sitemap.xml"));
            } else {
                pending.extend(listed);
            }
        }

        let mut read = HashSet::new();
        let mut urls = Vec::new();
        while let Some(sitemap) = pending.pop() {
            if urls.len() >= source.max_urls || read.len() >= MAX_SITEMAPS {
                break;
            }
            if !read.insert(sitemap.clone()) {
                continue;
            }
            let xml = match fetch_text(&self.client, &sitemap).await {
                Ok(xml) => xml,
                Err(IngestError::Http { status, .. }) if status < 500 && status != 429 => {
                    warn!("Skipping sitemap {}: HTTP {}", sitemap, status);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let entries = parse_sitemap(&xml);
            debug!(
                "Sitemap {} lists {} pages and {} sitemaps",
                sitemap,
                entries.urls.len(),
                entries.sitemaps.len()
            );
            urls.extend(entries.urls);
            pending.extend(entries.sitemaps);
        }
        Ok(urls)
    }

    /// The origin of `url` when its robots.txt asks for a crawl delay
    async fn delayed_origin(&self, source: &Source, url: &str) -> Option<(String, Duration)> {
        if !source.respect_robots_txt {
            return None;
        }
        let origin = Url::parse(url).ok().as_ref().and_then(origin_of)?;
        let delay = self.robots.crawl_delay(&origin).await?;
        Some((origin, delay))
    }

    /// Time left before `origin` may be fetched again
    fn politeness_wait(&self, origin: &str, delay: Duration) -> Option<Duration> {
        let last = self.last_fetch.get(origin)?;
        let ready_at = *last + delay;
        let now = Instant::now();
        (ready_at > now).then(|| ready_at - now)
    }

    /// Claims the next fetch of `origin`
    ///
    /// # Returns
    ///
    /// The remaining wait when another job claimed the origin first
    fn reserve_fetch(&self, origin: &str, delay: Duration) -> Option<Duration> {
        let now = Instant::now();
        match self.last_fetch.entry(origin.to_string()) {
            Entry::Occupied(mut last) => {
                let ready_at = *last.get() + delay;
                if ready_at > now {
                    return Some(ready_at - now);
                }
                last.insert(now);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                None
            }
        }
    }

    async fn fetch(
        &self,
        ctx: &JobContext,
        run: &Run,
        url: &str,
        priority: u32,
    ) -> Result<JobOutcome> {
        if run.stage > Stage::Scraping {
            debug!("Dropping late fetch of {}: run {} is {}", url, run.id, run.stage);
            return Ok(JobOutcome::Done);
        }
        let source = self.load_source(run).await?;
        let delayed = self.delayed_origin(&source, url).await;
        if let Some(wait) = delayed
            .as_ref()
            .and_then(|(origin, delay)| self.politeness_wait(origin, *delay))
        {
            debug!("Crawl delay holds {} for {:?}", url, wait);
            return Ok(JobOutcome::Deferred(wait));
        }

        let slot = self.fairness.acquire_slot(run.id).await;
        if !slot.acquired {
            debug!(
                "No fetch slot for run {} ({}/{} held, {} active runs): {}",
                run.id,
                slot.current_slots,
                slot.max_allowed_slots,
                slot.active_run_count,
                slot.reason.as_deref().unwrap_or("denied")
            );
            let delay = Duration::from_millis(slot.retry_delay_ms.unwrap_or(1000));
            return Ok(JobOutcome::Deferred(delay));
        }
        // Only a fetch that holds a slot uses up the origin's delay
        if let Some((origin, delay)) = &delayed {
            if let Some(wait) = self.reserve_fetch(origin, *delay) {
                self.fairness.release_slot(run.id).await;
                debug!("Crawl delay holds {} for {:?}", url, wait);
                return Ok(JobOutcome::Deferred(wait));
            }
        }
        let result = fetch_url(&self.client, url).await;
        self.fairness.release_slot(run.id).await;

        match result {
            FetchResult::Success {
                final_url,
                status_code,
                body,
                ..
            } => {
                self.stores
                    .pages
                    .save_fetched(run.id, url, status_code, &body)
                    .await?;
                self.stores
                    .runs
                    .increment_stat(run.id, RunStat::PagesSeen, 1)
                    .await?;
                debug!("Fetched {} ({} bytes)", url, body.len());

                if source.mode == SourceMode::Domain {
                    self.follow_links(ctx, &source, &final_url, &body, priority)
                        .await?;
                }
                self.report(ctx, Stage::Scraping, url, false).await?;
            }
            failure if failure.is_transient() => {
                return Err(match failure {
                    FetchResult::HttpError { status_code } => IngestError::Http {
                        url: url.to_string(),
                        status: status_code,
                    },
                    other => IngestError::Fetch {
                        url: url.to_string(),
                        reason: other.failure().unwrap_or_default(),
                    },
                });
            }
            failure => {
                let reason = failure.failure().unwrap_or_default();
                warn!("Failed to fetch {}: {}", url, reason);
                self.stores.pages.mark_failed(run.id, url, &reason).await?;
                self.crawl_state(run.id, source.max_urls)
                    .mark_failed(url)
                    .await?;
                self.report(ctx, Stage::Scraping, url, true).await?;
            }
        }
        Ok(JobOutcome::Done)
    }

    /// Queues same-site links of a fetched page
    ///
    /// The scraping total grows by the page's links before their jobs exist
    /// and before the page reports itself. A retried page gets back the links
    /// it admitted earlier and queues them again; the progress unit set
    /// counts a link's fetch once however many jobs it has.
    async fn follow_links(
        &self,
        ctx: &JobContext,
        source: &Source,
        page_url: &str,
        html: &str,
        priority: u32,
    ) -> Result<()> {
        let Ok(base) = Url::parse(page_url) else {
            return Ok(());
        };
        let seeds: Vec<Url> = source
            .urls
            .iter()
            .filter_map(|url| normalize_url(url).ok())
            .collect();
        let scope = SiteScope::new(seeds.iter(), &source.allowed_domains);

        let mut seen = HashSet::new();
        let candidates: Vec<String> = parse_html(html, &base)
            .links
            .iter()
            .filter_map(|link| normalize_url(link).ok())
            .filter(|link| scope.contains(link))
            .map(|link| link.to_string())
            .filter(|link| seen.insert(link.clone()))
            .collect();

        let filtered = self
            .robots
            .filter_urls_by_robots_rules(&candidates, source.respect_robots_txt)
            .await;
        let children = self
            .crawl_state(ctx.run_id, source.max_urls)
            .queue_children(page_url, &filtered.allowed)
            .await?;
        if children.is_empty() {
            return Ok(());
        }

        let added = self
            .progress
            .extend_total(ctx.run_id, Stage::Scraping, &children)
            .await?;
        for url in &children {
            self.queue
                .enqueue(
                    JobPayload::Fetch {
                        ctx: ctx.clone(),
                        url: url.clone(),
                    },
                    priority,
                )
                .await?;
        }
        debug!(
            "Queued {} links from {} ({} new, {} blocked by robots.txt)",
            children.len(),
            page_url,
            added,
            filtered.blocked.len()
        );
        Ok(())
    }

    async fn process_page(&self, ctx: &JobContext, run: &Run, url: &str) -> Result<JobOutcome> {
        let page = self
            .stores
            .pages
            .get_page(run.id, url)
            .await?
            .ok_or_else(|| IngestError::not_found("page", url))?;
        if page.state != PageState::Fetched {
            debug!("{} of run {} is already {}", url, run.id, page.state);
            self.report(ctx, Stage::Processing, url, false).await?;
            return Ok(JobOutcome::Done);
        }

        let base = Url::parse(url).map_err(|e| UrlError::Parse(e.to_string()))?;
        let text = parse_html(page.html.as_deref().unwrap_or_default(), &base).text;
        let content_hash = hex::encode(Sha256::digest(text.as_bytes()));

        let unchanged = !run.force_reindex
            && self
                .stores
                .pages
                .previous_content_hash(run.source_id, url, run.id)
                .await?
                .is_some_and(|previous| previous == content_hash);
        let state = if unchanged {
            PageState::Unchanged
        } else {
            PageState::Extracted
        };

        self.stores
            .pages
            .record_extraction(run.id, url, &text, &content_hash, state)
            .await?;
        if unchanged {
            debug!("{} is unchanged since the last run", url);
            self.stores
                .runs
                .increment_stat(run.id, RunStat::PagesSkipped, 1)
                .await?;
        }
        self.report(ctx, Stage::Processing, url, false).await?;
        Ok(JobOutcome::Done)
    }

    async fn index_page(&self, ctx: &JobContext, run: &Run, url: &str) -> Result<JobOutcome> {
        let page = self
            .stores
            .pages
            .get_page(run.id, url)
            .await?
            .ok_or_else(|| IngestError::not_found("page", url))?;
        if page.state != PageState::Extracted {
            debug!("{} of run {} is already {}", url, run.id, page.state);
            self.report(ctx, Stage::Indexing, url, false).await?;
            return Ok(JobOutcome::Done);
        }

        let chunks: Vec<NewChunk> = chunk_text(
            page.text.as_deref().unwrap_or_default(),
            self.config.chunk_size,
            self.config.chunk_overlap,
        )
        .into_iter()
        .enumerate()
        .map(|(index, content)| NewChunk { index, content })
        .collect();

        let stored = self
            .stores
            .chunks
            .replace_chunks(run.id, url, &chunks)
            .await?;
        self.stores.pages.mark_indexed(run.id, url).await?;
        self.stores
            .runs
            .increment_stat(run.id, RunStat::PagesIndexed, 1)
            .await?;
        self.stores
            .runs
            .increment_stat(run.id, RunStat::ChunksToEmbed, stored.len() as u64)
            .await?;
        debug!("Indexed {} into {} chunks", url, stored.len());

        self.report(ctx, Stage::Indexing, url, false).await?;
        Ok(JobOutcome::Done)
    }

    async fn embed_batch(
        &self,
        ctx: &JobContext,
        run: &Run,
        batch_index: usize,
        chunk_ids: &[Uuid],
    ) -> Result<JobOutcome> {
        let vectors = self
            .vectors
            .as_ref()
            .ok_or_else(|| IngestError::NotConfigured("no vector store".into()))?;
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| IngestError::NotConfigured("no embedder".into()))?;
        if let Some(expected) = run.embedding_dimensions {
            if expected != embedder.dimensions() {
                return Err(IngestError::NotConfigured(format!(
                    "run expects {expected}-dimension embeddings, embedder produces {}",
                    embedder.dimensions()
                )));
            }
        }

        let unit = format!("batch-{batch_index}");
        let pending: Vec<_> = self
            .stores
            .chunks
            .get_chunks(chunk_ids)
            .await?
            .into_iter()
            .filter(|chunk| !chunk.embedded)
            .collect();
        if pending.is_empty() {
            self.report(ctx, Stage::Embedding, &unit, false).await?;
            return Ok(JobOutcome::Done);
        }

        let texts: Vec<String> = pending.iter().map(|chunk| chunk.content.clone()).collect();
        let embeddings = embedder.embed(&texts).await?;
        if embeddings.len() != pending.len() {
            return Err(IngestError::Embedding(format!(
                "expected {} vectors, got {}",
                pending.len(),
                embeddings.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|v| v.len() != embedder.dimensions()) {
            return Err(IngestError::Embedding(format!(
                "vector has {} dimensions, expected {}",
                bad.len(),
                embedder.dimensions()
            )));
        }

        let ids: Vec<Uuid> = pending.iter().map(|chunk| chunk.id).collect();
        let records = pending
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, vector)| VectorRecord {
                chunk_id: chunk.id,
                run_id: run.id,
                tenant_id: ctx.tenant_id.clone(),
                url: chunk.url,
                vector,
            })
            .collect();
        vectors.upsert(records).await?;
        self.stores.chunks.mark_embedded(&ids).await?;
        self.stores
            .runs
            .increment_stat(run.id, RunStat::ChunksEmbedded, ids.len() as u64)
            .await?;
        debug!("Embedded {} chunks of run {}", ids.len(), run.id);

        self.report(ctx, Stage::Embedding, &unit, false).await?;
        Ok(JobOutcome::Done)
    }
}
