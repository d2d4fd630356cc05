//! In-process implementation of [`KvStore`]
//!
//! Every operation runs under the per-key shard lock of a `DashMap`, which
//! makes it atomic with respect to every other operation on the same key.

use crate::storage::kv::{KvStore, LeaseDenial, LeaseOutcome, LeaseRequest};
use crate::storage::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct MemberSet {
    order: Vec<String>,
    index: HashSet<String>,
}

impl MemberSet {
    fn insert(&mut self, member: &str) -> bool {
        if self.index.insert(member.to_string()) {
            self.order.push(member.to_string());
            true
        } else {
            false
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        if self.index.remove(member) {
            self.order.retain(|m| m != member);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug)]
enum Value {
    Text(String),
    Set(MemberSet),
    Hash(HashMap<String, i64>),
    /// holder -> expiry of each held lease
    Leases(HashMap<String, Vec<Instant>>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// DashMap-backed atomic store for a single process
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
    unavailable: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail as if the store were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Locks the live entry at `key`, creating it with `default` when absent or expired
    fn entry_or_insert(
        &self,
        key: &str,
        default: impl FnOnce() -> Value,
    ) -> RefMut<'_, String, Entry> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Entry::new(default(), None));
                }
                occupied.into_ref()
            }
            DashEntry::Vacant(vacant) => vacant.insert(Entry::new(default(), None)),
        }
    }

    /// Drops the entry if it has expired, so reads can treat it as absent
    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), Entry::new(Value::Text(value.to_string()), ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let fresh = || Entry::new(Value::Text(value.to_string()), ttl);
        match self.entries.entry(key.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            DashEntry::Vacant(vacant) => {
                vacant.insert(fresh());
                Ok(true)
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, entry)| !entry.is_expired(now))
            .count())
    }

    async fn add_new_members(
        &self,
        key: &str,
        members: &[String],
        limit: Option<usize>,
        mirror: Option<&str>,
    ) -> StoreResult<Vec<String>> {
        self.check_available()?;

        let admitted = {
            let mut entry = self.entry_or_insert(key, || Value::Set(MemberSet::default()));
            let Value::Set(set) = &mut entry.value else {
                return Err(wrong_type(key));
            };

            let mut admitted = Vec::new();
            for member in members {
                if limit.is_some_and(|limit| set.len() >= limit) {
                    break;
                }
                if set.insert(member) {
                    admitted.push(member.clone());
                }
            }
            admitted
        };

        if let Some(mirror) = mirror {
            if !admitted.is_empty() {
                let mut entry = self.entry_or_insert(mirror, || Value::Set(MemberSet::default()));
                let Value::Set(set) = &mut entry.value else {
                    return Err(wrong_type(mirror));
                };
                for member in &admitted {
                    set.insert(member);
                }
            }
        }

        Ok(admitted)
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        self.purge_expired(key);
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        let Value::Set(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        Ok(members.iter().filter(|m| set.remove(m)).count())
    }

    async fn members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.order.clone()),
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn member_count(&self, key: &str) -> StoreResult<usize> {
        self.check_available()?;
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.len()),
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn hash_reset(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let hash = fields
            .iter()
            .map(|(field, value)| (field.to_string(), *value))
            .collect();
        self.entries
            .insert(key.to_string(), Entry::new(Value::Hash(hash), ttl));
        Ok(())
    }

    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> StoreResult<Option<HashMap<String, i64>>> {
        self.check_available()?;
        self.purge_expired(key);
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        *hash.entry(field.to_string()).or_insert(0) += delta;
        Ok(Some(hash.clone()))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        self.check_available()?;
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.clone()),
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn acquire_lease(&self, request: LeaseRequest<'_>) -> StoreResult<LeaseOutcome> {
        self.check_available()?;
        let now = Instant::now();

        let mut entry = self.entry_or_insert(request.pool, || Value::Leases(HashMap::new()));
        let Value::Leases(holders) = &mut entry.value else {
            return Err(wrong_type(request.pool));
        };

        for leases in holders.values_mut() {
            leases.retain(|expiry| *expiry > now);
        }
        holders.retain(|_, leases| !leases.is_empty());

        let pool_leases: usize = holders.values().map(Vec::len).sum();
        let holder_leases = holders.get(request.holder).map_or(0, Vec::len);

        let denied_by = if holder_leases >= request.holder_limit {
            Some(LeaseDenial::HolderLimit)
        } else if pool_leases >= request.pool_limit {
            Some(LeaseDenial::PoolLimit)
        } else {
            None
        };

        if let Some(denial) = denied_by {
            return Ok(LeaseOutcome {
                granted: false,
                holder_leases,
                pool_leases,
                denied_by: Some(denial),
            });
        }

        holders
            .entry(request.holder.to_string())
            .or_default()
            .push(now + request.ttl);

        Ok(LeaseOutcome {
            granted: true,
            holder_leases: holder_leases + 1,
            pool_leases: pool_leases + 1,
            denied_by: None,
        })
    }

    async fn release_lease(&self, pool: &str, holder: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(pool) else {
            return Ok(false);
        };
        let Value::Leases(holders) = &mut entry.value else {
            return Err(wrong_type(pool));
        };
        let Some(leases) = holders.get_mut(holder) else {
            return Ok(false);
        };

        leases.retain(|expiry| *expiry > now);
        let oldest = leases
            .iter()
            .enumerate()
            .min_by_key(|(_, expiry)| **expiry)
            .map(|(i, _)| i);
        let released = match oldest {
            Some(i) => {
                leases.swap_remove(i);
                true
            }
            None => false,
        };
        if leases.is_empty() {
            holders.remove(holder);
        }
        Ok(released)
    }

    async fn lease_count(&self, pool: &str, holder: &str) -> StoreResult<usize> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.get(pool) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Leases(holders) => Ok(holders
                    .get(holder)
                    .map_or(0, |leases| leases.iter().filter(|e| **e > now).count())),
                _ => Err(wrong_type(pool)),
            },
        }
    }
}
