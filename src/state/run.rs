use crate::config::{SourceEntry, SourceMode};
use crate::state::{RunStatus, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A crawl source: where a run's URLs come from and how to treat them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub mode: SourceMode,
    pub urls: Vec<String>,
    pub max_urls: usize,
    pub respect_robots_txt: bool,
    pub allowed_domains: Vec<String>,
}

impl Source {
    pub fn from_entry(entry: &SourceEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: entry.tenant.clone(),
            name: entry.name.clone(),
            mode: entry.mode,
            urls: entry.urls.clone(),
            max_urls: entry.max_urls,
            respect_robots_txt: entry.respect_robots_txt,
            allowed_domains: entry.allowed_domains.clone(),
        }
    }
}

/// Per-run counters maintained by job processors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub pages_seen: u64,
    pub pages_indexed: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub chunks_to_embed: u64,
    pub chunks_embedded: u64,
    /// Discovery and embedding units that ran out of attempts
    pub units_failed: u64,
}

/// One counter of [`RunStats`], for atomic increments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStat {
    PagesSeen,
    PagesIndexed,
    PagesFailed,
    PagesSkipped,
    ChunksToEmbed,
    ChunksEmbedded,
}

impl RunStat {
    pub fn column(self) -> &'static str {
        match self {
            Self::PagesSeen => "pages_seen",
            Self::PagesIndexed => "pages_indexed",
            Self::PagesFailed => "pages_failed",
            Self::PagesSkipped => "pages_skipped",
            Self::ChunksToEmbed => "chunks_to_embed",
            Self::ChunksEmbedded => "chunks_embedded",
        }
    }
}

/// Fields needed to create a run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub source_id: Uuid,
    pub tenant_id: String,
    pub force_reindex: bool,
    pub embedding_dimensions: Option<usize>,
    pub config_hash: Option<String>,
}

/// One execution of a source's pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub source_id: Uuid,
    pub tenant_id: String,
    pub status: RunStatus,
    pub stage: Stage,
    pub stats: RunStats,
    pub force_reindex: bool,
    /// Vector width this run's chunks must be embedded with
    pub embedding_dimensions: Option<usize>,
    pub config_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn is_canceled(&self) -> bool {
        self.status == RunStatus::Canceled
    }
}

impl RunStats {
    /// Whether the run lost work in any stage
    pub fn has_failures(&self) -> bool {
        self.pages_failed > 0
            || self.units_failed > 0
            || self.chunks_embedded < self.chunks_to_embed
    }
}

/// Classifies the terminal status of a finished run
///
/// Skipped pages count as neither success nor failure. A run with no failures
/// succeeded, even when it had nothing to do; a run with failures and nothing
/// indexed failed.
pub fn classify_final_status(stats: &RunStats) -> RunStatus {
    match (stats.pages_indexed, stats.has_failures()) {
        (_, false) => RunStatus::Succeeded,
        (0, true) => RunStatus::Failed,
        _ => RunStatus::Partial,
    }
}
