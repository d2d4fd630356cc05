//! Stage machinery: jobs, the queue, fairness, and the workers that run them

pub mod chunking;
pub mod embed;
pub mod fairness;
pub mod jobs;
pub mod manager;
pub mod processors;
pub mod queue;
pub mod queuer;
pub mod worker;

pub use chunking::chunk_text;
pub use embed::{Embedder, HashingEmbedder, MemoryVectorStore, VectorRecord, VectorStore};
pub use fairness::{FairnessScheduler, SlotAcquisition};
pub use jobs::{stage_priority, Job, JobContext, JobPayload, CONTROL_PRIORITY};
pub use manager::{StageManager, TransitionOutcome};
pub use processors::{JobOutcome, JobProcessor};
pub use queue::{JobQueue, MemoryJobQueue};
pub use queuer::StageJobQueuer;
pub use worker::{retry_backoff, WorkerPool};

use crate::storage::{ChunkStore, KvStore, PageStore, RunStore, SourceStore, SqliteStore};
use std::sync::Arc;

/// Handles on every store the pipeline reads or writes
#[derive(Clone)]
pub struct Stores {
    pub runs: Arc<dyn RunStore>,
    pub sources: Arc<dyn SourceStore>,
    pub pages: Arc<dyn PageStore>,
    pub chunks: Arc<dyn ChunkStore>,
    pub kv: Arc<dyn KvStore>,
}

impl Stores {
    /// Durable records in one SQLite database, ephemeral state in `kv`
    pub fn sqlite(db: Arc<SqliteStore>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            runs: db.clone(),
            sources: db.clone(),
            pages: db.clone(),
            chunks: db,
            kv,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{PipelineConfig, RobotsConfig, SourceMode};
    use crate::robots::{RobotsCache, RobotsEngine};
    use crate::state::{NewRun, Run, Source};
    use crate::storage::MemoryKvStore;
    use std::time::Duration;
    use uuid::Uuid;

    pub fn stores() -> Stores {
        let db = Arc::new(SqliteStore::new_in_memory().unwrap());
        Stores::sqlite(db, Arc::new(MemoryKvStore::new()))
    }

    /// Saves a source and creates a pending run for it
    pub async fn seed_run(stores: &Stores, mode: SourceMode, urls: &[String]) -> (Source, Run) {
        let source = Source {
            id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            name: "docs".into(),
            mode,
            urls: urls.to_vec(),
            max_urls: 100,
            respect_robots_txt: true,
            allowed_domains: vec![],
        };
        stores.sources.save_source(&source).await.unwrap();
        let run = stores
            .runs
            .create_run(NewRun {
                source_id: source.id,
                tenant_id: source.tenant_id.clone(),
                force_reindex: false,
                embedding_dimensions: None,
                config_hash: None,
            })
            .await
            .unwrap();
        (source, run)
    }

    /// A processor with robots.txt enforcement switched off
    pub fn processor(
        stores: &Stores,
        queue: Arc<dyn JobQueue>,
        fairness: Arc<FairnessScheduler>,
        config: PipelineConfig,
    ) -> JobProcessor {
        let client = reqwest::Client::new();
        let robots = RobotsEngine::new(
            client.clone(),
            RobotsCache::new(stores.kv.clone(), Duration::from_secs(60)),
            &RobotsConfig {
                enabled: false,
                ..RobotsConfig::default()
            },
            "TestBot",
        );
        JobProcessor::new(
            stores.clone(),
            queue,
            fairness,
            Arc::new(robots),
            client,
            config,
        )
    }
}
