//! Admission control over concurrent fetch capacity
//!
//! Slots are TTL leases in one global pool. A run may hold at most its
//! allowance, which shrinks as more runs become active:
//!
//! ```text
//! allowance = clamp(ceil(total_slots / active_runs), min_slots_per_run, max_slots_per_run)
//! ```
//!
//! The global pool limit is enforced on top of the allowance, so when the
//! per-run floor oversubscribes the pool some runs wait for a slot to free up.

use crate::config::FairnessConfig;
use crate::storage::{KvStore, LeaseDenial, LeaseRequest, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const ACTIVE_RUNS_KEY: &str = "fairness:active-runs";
const SLOT_POOL_KEY: &str = "fairness:slots";

/// Outcome of a slot request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAcquisition {
    pub acquired: bool,
    /// Slots the run holds after the request
    pub current_slots: u32,
    pub max_allowed_slots: u32,
    pub active_run_count: u32,
    pub reason: Option<String>,
    /// Suggested wait before asking again; set on denial
    pub retry_delay_ms: Option<u64>,
}

pub struct FairnessScheduler {
    kv: Arc<dyn KvStore>,
    config: FairnessConfig,
}

impl FairnessScheduler {
    pub fn new(kv: Arc<dyn KvStore>, config: FairnessConfig) -> Self {
        Self { kv, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Allowance of each run when `active_runs` runs are registered
    pub fn allowance(&self, active_runs: u32) -> u32 {
        let active = active_runs.max(1);
        let fair_share = self.config.total_slots.div_ceil(active);
        fair_share.clamp(self.config.min_slots_per_run, self.config.max_slots_per_run)
    }

    pub async fn register_run(&self, run_id: Uuid) -> StoreResult<()> {
        let added = self
            .kv
            .add_new_members(ACTIVE_RUNS_KEY, &[run_id.to_string()], None, None)
            .await?;
        if !added.is_empty() {
            debug!("Registered run {} for fetch slots", run_id);
        }
        Ok(())
    }

    pub async fn unregister_run(&self, run_id: Uuid) -> StoreResult<()> {
        self.kv
            .remove_members(ACTIVE_RUNS_KEY, &[run_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn active_run_count(&self) -> StoreResult<u32> {
        let count = self.kv.member_count(ACTIVE_RUNS_KEY).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Tries to take one fetch slot for `run_id`
    ///
    /// Never errors: a disabled scheduler always grants, and a store failure
    /// denies.
    pub async fn acquire_slot(&self, run_id: Uuid) -> SlotAcquisition {
        if !self.config.enabled {
            return SlotAcquisition {
                acquired: true,
                current_slots: 0,
                max_allowed_slots: self.config.total_slots,
                active_run_count: 0,
                reason: None,
                retry_delay_ms: None,
            };
        }

        match self.try_acquire(run_id).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                warn!("Denying fetch slot for run {}: {}", run_id, e);
                SlotAcquisition {
                    acquired: false,
                    current_slots: 0,
                    max_allowed_slots: 0,
                    active_run_count: 0,
                    reason: Some(format!("slot store unavailable: {e}")),
                    retry_delay_ms: Some(self.config.retry_delay_ms),
                }
            }
        }
    }

    async fn try_acquire(&self, run_id: Uuid) -> StoreResult<SlotAcquisition> {
        let active_run_count = self.active_run_count().await?;
        let max_allowed_slots = self.allowance(active_run_count);
        let holder = run_id.to_string();

        let outcome = self
            .kv
            .acquire_lease(LeaseRequest {
                pool: SLOT_POOL_KEY,
                holder: &holder,
                holder_limit: max_allowed_slots as usize,
                pool_limit: self.config.total_slots as usize,
                ttl: Duration::from_secs(self.config.slot_ttl_seconds),
            })
            .await?;

        let reason = outcome.denied_by.map(|denial| match denial {
            LeaseDenial::HolderLimit => {
                format!("run holds its allowance of {max_allowed_slots} slots")
            }
            LeaseDenial::PoolLimit => format!(
                "all {} slots are in use",
                self.config.total_slots
            ),
        });

        Ok(SlotAcquisition {
            acquired: outcome.granted,
            current_slots: u32::try_from(outcome.holder_leases).unwrap_or(u32::MAX),
            max_allowed_slots,
            active_run_count,
            retry_delay_ms: (!outcome.granted).then_some(self.config.retry_delay_ms),
            reason,
        })
    }

    /// Returns one slot of `run_id` to the pool
    ///
    /// Failures are logged and swallowed; the slot's TTL reclaims it.
    pub async fn release_slot(&self, run_id: Uuid) {
        if !self.config.enabled {
            return;
        }
        if let Err(e) = self.kv.release_lease(SLOT_POOL_KEY, &run_id.to_string()).await {
            warn!("Failed to release fetch slot for run {}: {}", run_id, e);
        }
    }
}
