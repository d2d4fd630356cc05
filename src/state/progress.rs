//! Atomic per-run, per-stage completion counters
//!
//! A stage's progress is a hash `{total, completed, failed}` in the shared
//! store plus a set of the units that already reported. The set makes
//! redelivered reports harmless; the hash increment returns the post-state in
//! the same round trip, so exactly one report observes the completing edge.

use crate::state::Stage;
use crate::storage::{KvStore, StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const TOTAL: &str = "total";
const COMPLETED: &str = "completed";
const FAILED: &str = "failed";

/// Snapshot of one stage's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StageProgress {
    fn from_fields(fields: &HashMap<String, i64>) -> Self {
        let field = |name| fields.get(name).copied().unwrap_or(0).max(0) as u64;
        Self {
            total: field(TOTAL),
            completed: field(COMPLETED),
            failed: field(FAILED),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// Result of reporting one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub progress: StageProgress,
    /// True only for the report that completed the stage
    pub just_completed: bool,
    /// The unit had already reported; nothing was counted
    pub duplicate: bool,
}

/// Tracks completion of every stage of every run
#[derive(Clone)]
pub struct StageProgressTracker {
    kv: Arc<dyn KvStore>,
}

impl StageProgressTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn counters_key(run_id: Uuid, stage: Stage) -> String {
        format!("progress:{run_id}:{stage}")
    }

    fn units_key(run_id: Uuid, stage: Stage) -> String {
        format!("progress:{run_id}:{stage}:units")
    }

    fn expected_key(run_id: Uuid, stage: Stage) -> String {
        format!("progress:{run_id}:{stage}:expected")
    }

    /// Resets a stage's counters to `total` outstanding units
    ///
    /// Must run before any job of the stage is enqueued.
    pub async fn initialize_stage_progress(
        &self,
        run_id: Uuid,
        stage: Stage,
        total: u64,
    ) -> StoreResult<()> {
        self.kv
            .delete(&[
                Self::units_key(run_id, stage),
                Self::expected_key(run_id, stage),
            ])
            .await?;
        self.kv
            .hash_reset(
                &Self::counters_key(run_id, stage),
                &[(TOTAL, total as i64), (COMPLETED, 0), (FAILED, 0)],
                None,
            )
            .await
    }

    /// Grows a stage's total by the units it has not counted yet
    ///
    /// Used when scraping discovers new URLs; the reporting unit must extend
    /// the total before it reports itself, otherwise the stage could complete
    /// early. Units already added by an earlier call are skipped, so a retried
    /// caller can pass the same units again.
    ///
    /// # Returns
    ///
    /// How many units this call added to the total
    pub async fn extend_total(
        &self,
        run_id: Uuid,
        stage: Stage,
        units: &[String],
    ) -> StoreResult<u64> {
        if units.is_empty() {
            return Ok(0);
        }
        let expected_key = Self::expected_key(run_id, stage);
        let added = self
            .kv
            .add_new_members(&expected_key, units, None, None)
            .await?;
        if added.is_empty() {
            return Ok(0);
        }

        let key = Self::counters_key(run_id, stage);
        let grown = self.kv.hash_increment(&key, TOTAL, added.len() as i64).await;
        match grown {
            Ok(Some(_)) => Ok(added.len() as u64),
            Ok(None) => {
                self.kv.remove_members(&expected_key, &added).await?;
                Err(StoreError::MissingKey(key))
            }
            Err(e) => {
                // Best effort: an unreachable store fails the retry anyway
                let _ = self.kv.remove_members(&expected_key, &added).await;
                Err(e)
            }
        }
    }

    /// Counts one unit as completed or failed
    ///
    /// # Arguments
    ///
    /// * `unit` - Stable identifier of the unit (a URL, a batch index)
    /// * `failed` - Count the unit against `failed` instead of `completed`
    ///
    /// # Returns
    ///
    /// The post-increment counters. A unit that already reported is not
    /// counted again and never reports `just_completed`. Errors when the
    /// stage has no progress record, which callers treat as retryable.
    pub async fn increment_stage_progress(
        &self,
        run_id: Uuid,
        stage: Stage,
        unit: &str,
        failed: bool,
    ) -> StoreResult<ProgressUpdate> {
        let units_key = Self::units_key(run_id, stage);
        let counters_key = Self::counters_key(run_id, stage);
        let unit = unit.to_string();

        let admitted = self
            .kv
            .add_new_members(&units_key, std::slice::from_ref(&unit), None, None)
            .await?;
        if admitted.is_empty() {
            debug!("Duplicate progress report for {} in {} of run {}", unit, stage, run_id);
            let fields = self.kv.hash_get_all(&counters_key).await?;
            return Ok(ProgressUpdate {
                progress: StageProgress::from_fields(&fields),
                just_completed: false,
                duplicate: true,
            });
        }

        let field = if failed { FAILED } else { COMPLETED };
        let Some(fields) = self.kv.hash_increment(&counters_key, field, 1).await? else {
            // Let a retry count the unit once the counters exist
            self.kv.remove_members(&units_key, &[unit]).await?;
            return Err(StoreError::MissingKey(counters_key));
        };

        let progress = StageProgress::from_fields(&fields);
        Ok(ProgressUpdate {
            progress,
            just_completed: progress.completed + progress.failed == progress.total,
            duplicate: false,
        })
    }

    pub async fn get_stage_progress(
        &self,
        run_id: Uuid,
        stage: Stage,
    ) -> StoreResult<Option<StageProgress>> {
        let fields = self
            .kv
            .hash_get_all(&Self::counters_key(run_id, stage))
            .await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(StageProgress::from_fields(&fields)))
        }
    }

    /// Deletes the progress records of every stage of a run
    pub async fn cleanup(&self, run_id: Uuid) -> StoreResult<usize> {
        let keys: Vec<String> = Stage::ORDER
            .iter()
            .flat_map(|stage| {
                [
                    Self::counters_key(run_id, *stage),
                    Self::units_key(run_id, *stage),
                    Self::expected_key(run_id, *stage),
                ]
            })
            .collect();
        self.kv.delete(&keys).await
    }
}
