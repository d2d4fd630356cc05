//! Two-tier robots.txt cache
//!
//! An optional in-process tier sits in front of the shared durable tier in the
//! key-value store. Both tiers expire entries by TTL and nothing invalidates
//! them early. Cache failures are logged and treated as misses.

use crate::robots::ParsedRobotsTxt;
use crate::storage::KvStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-process cache of parsed files keyed by origin
#[derive(Debug)]
pub struct MemoryRobotsCache {
    entries: DashMap<String, (ParsedRobotsTxt, Instant)>,
    ttl: Duration,
}

impl MemoryRobotsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, origin: &str) -> Option<ParsedRobotsTxt> {
        let now = Instant::now();
        self.entries.remove_if(origin, |_, (_, expires)| *expires <= now);
        self.entries.get(origin).map(|entry| entry.0.clone())
    }

    pub fn insert(&self, origin: &str, robots: ParsedRobotsTxt) {
        self.entries
            .insert(origin.to_string(), (robots, Instant::now() + self.ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache lookups for the robots engine
pub struct RobotsCache {
    memory: Option<MemoryRobotsCache>,
    kv: Arc<dyn KvStore>,
    durable_ttl: Duration,
}

impl RobotsCache {
    pub fn new(kv: Arc<dyn KvStore>, durable_ttl: Duration) -> Self {
        Self {
            memory: None,
            kv,
            durable_ttl,
        }
    }

    /// Puts an in-process tier in front of the durable one
    pub fn with_memory_tier(mut self, memory: MemoryRobotsCache) -> Self {
        self.memory = Some(memory);
        self
    }

    fn durable_key(origin: &str) -> String {
        format!("robots:{origin}")
    }

    pub async fn get(&self, origin: &str) -> Option<ParsedRobotsTxt> {
        if let Some(hit) = self.memory.as_ref().and_then(|m| m.get(origin)) {
            return Some(hit);
        }

        let json = match self.kv.get(&Self::durable_key(origin)).await {
            Ok(json) => json?,
            Err(e) => {
                warn!("robots cache read failed for {}: {}", origin, e);
                return None;
            }
        };
        let robots: ParsedRobotsTxt = match serde_json::from_str(&json) {
            Ok(robots) => robots,
            Err(e) => {
                warn!("Discarding unreadable robots cache entry for {}: {}", origin, e);
                return None;
            }
        };

        if let Some(memory) = &self.memory {
            memory.insert(origin, robots.clone());
        }
        Some(robots)
    }

    /// Stores a parsed file in every tier
    ///
    /// Files that failed to fetch only go to the in-process tier so the next
    /// process retries the site instead of inheriting the failure.
    pub async fn put(&self, origin: &str, robots: &ParsedRobotsTxt) {
        if let Some(memory) = &self.memory {
            memory.insert(origin, robots.clone());
        }
        if !robots.is_valid {
            return;
        }

        let json = match serde_json::to_string(robots) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode robots.txt for {}: {}", origin, e);
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set(&Self::durable_key(origin), &json, Some(self.durable_ttl))
            .await
        {
            warn!("robots cache write failed for {}: {}", origin, e);
        }
    }
}
