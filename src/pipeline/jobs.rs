//! Job payloads and priorities
//!
//! Payloads are a tagged union keyed by `kind`, so a queue backed by JSON
//! (or anything serde speaks) can carry them unchanged.

use crate::state::Stage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority of control jobs (stage transitions, finalization)
pub const CONTROL_PRIORITY: u32 = 0;

/// Item count that adds one step of priority
pub const PRIORITY_STEP: usize = 50;

/// Numerically highest (least urgent) priority a stage job can get
pub const MAX_JOB_PRIORITY: u32 = 20;

/// Priority of the jobs of a stage with `total_items` units
///
/// Lower numbers run first, so small runs get through ahead of large ones
/// without starving them: the value is capped at [`MAX_JOB_PRIORITY`].
pub fn stage_priority(total_items: usize) -> u32 {
    let steps = u32::try_from(total_items / PRIORITY_STEP).unwrap_or(u32::MAX);
    steps.saturating_add(1).min(MAX_JOB_PRIORITY)
}

/// Fields every payload carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub tenant_id: String,
    pub run_id: Uuid,
    /// Correlates the logs of every job a run spawns
    pub trace_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Discover {
        #[serde(flatten)]
        ctx: JobContext,
    },
    Fetch {
        #[serde(flatten)]
        ctx: JobContext,
        url: String,
    },
    Process {
        #[serde(flatten)]
        ctx: JobContext,
        url: String,
    },
    Index {
        #[serde(flatten)]
        ctx: JobContext,
        url: String,
    },
    EmbedBatch {
        #[serde(flatten)]
        ctx: JobContext,
        batch_index: usize,
        chunk_ids: Vec<Uuid>,
    },
    StageTransition {
        #[serde(flatten)]
        ctx: JobContext,
        from: Stage,
    },
    Finalize {
        #[serde(flatten)]
        ctx: JobContext,
    },
}

impl JobPayload {
    pub fn context(&self) -> &JobContext {
        match self {
            Self::Discover { ctx }
            | Self::Fetch { ctx, .. }
            | Self::Process { ctx, .. }
            | Self::Index { ctx, .. }
            | Self::EmbedBatch { ctx, .. }
            | Self::StageTransition { ctx, .. }
            | Self::Finalize { ctx } => ctx,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discover { .. } => "discover",
            Self::Fetch { .. } => "fetch",
            Self::Process { .. } => "process",
            Self::Index { .. } => "index",
            Self::EmbedBatch { .. } => "embed_batch",
            Self::StageTransition { .. } => "stage_transition",
            Self::Finalize { .. } => "finalize",
        }
    }

    /// The stage and unit this job reports progress for
    ///
    /// `None` for control jobs, which are not units of any stage.
    pub fn progress_unit(&self) -> Option<(Stage, String)> {
        match self {
            Self::Discover { .. } => Some((Stage::Discovering, "discover".to_string())),
            Self::Fetch { url, .. } => Some((Stage::Scraping, url.clone())),
            Self::Process { url, .. } => Some((Stage::Processing, url.clone())),
            Self::Index { url, .. } => Some((Stage::Indexing, url.clone())),
            Self::EmbedBatch { batch_index, .. } => {
                Some((Stage::Embedding, format!("batch-{batch_index}")))
            }
            Self::StageTransition { .. } | Self::Finalize { .. } => None,
        }
    }
}

/// A payload as held by a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub payload: JobPayload,
    pub priority: u32,
    /// Failed attempts so far
    pub attempts: u32,
}

impl Job {
    pub fn new(payload: JobPayload, priority: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            attempts: 0,
        }
    }
}
