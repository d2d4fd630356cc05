//! Atomic key-value primitives shared by every worker
//!
//! Crawl state, stage progress, fairness slots and the shared robots cache all
//! live behind this trait. Each method is one round trip and atomic on its
//! own; callers never read, modify and write back a value.

use crate::storage::StoreResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Parameters for taking one lease out of a bounded pool
#[derive(Debug, Clone, Copy)]
pub struct LeaseRequest<'a> {
    /// Pool key; all holders share its `pool_limit`
    pub pool: &'a str,
    pub holder: &'a str,
    /// Maximum leases this holder may hold at once
    pub holder_limit: usize,
    /// Maximum leases across all holders
    pub pool_limit: usize,
    /// Lease lifetime if it is never released
    pub ttl: Duration,
}

/// Why a lease request was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDenial {
    HolderLimit,
    PoolLimit,
}

/// Post-state of a lease request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOutcome {
    pub granted: bool,
    /// Leases the holder holds after the request
    pub holder_leases: usize,
    /// Leases held across the pool after the request
    pub pool_leases: usize,
    pub denied_by: Option<LeaseDenial>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Writes only when the key is absent; returns whether it wrote
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<bool>;

    /// Deletes keys of any type; returns how many existed
    async fn delete(&self, keys: &[String]) -> StoreResult<usize>;

    /// Adds the members not yet in the set at `key` and returns exactly those
    ///
    /// When `limit` is set the set never grows beyond it; members past the
    /// limit are dropped. Admitted members are also added to the set at
    /// `mirror` when given.
    async fn add_new_members(
        &self,
        key: &str,
        members: &[String],
        limit: Option<usize>,
        mirror: Option<&str>,
    ) -> StoreResult<Vec<String>>;

    async fn remove_members(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    /// Members in insertion order
    async fn members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn member_count(&self, key: &str) -> StoreResult<usize>;

    /// Replaces the hash at `key` with the given integer fields
    async fn hash_reset(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Adds `delta` to one field of an existing hash and returns every field
    ///
    /// Returns `None` without creating anything when the hash does not exist.
    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> StoreResult<Option<HashMap<String, i64>>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, i64>>;

    /// Takes one lease if both the holder and the pool are under their limits
    async fn acquire_lease(&self, request: LeaseRequest<'_>) -> StoreResult<LeaseOutcome>;

    /// Returns the holder's oldest lease to the pool; false if it held none
    async fn release_lease(&self, pool: &str, holder: &str) -> StoreResult<bool>;

    /// Live leases of one holder
    async fn lease_count(&self, pool: &str, holder: &str) -> StoreResult<usize>;
}
