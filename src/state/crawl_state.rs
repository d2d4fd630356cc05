//! Per-run URL frontier and dedup set
//!
//! All keys live in the shared [`KvStore`] so every worker sees the same
//! frontier. The known-URL set is the dedup boundary: a URL enters it at most
//! once per run, and only on entry is it copied into the queued frontier.

use crate::config::SourceMode;
use crate::storage::{KvStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Write-once context of a run's crawl
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlMetadata {
    pub source_id: Uuid,
    pub tenant_id: String,
    pub mode: SourceMode,
    pub max_urls: usize,
    pub started_at: DateTime<Utc>,
}

/// Handle on one run's crawl state
#[derive(Clone)]
pub struct CrawlState {
    kv: Arc<dyn KvStore>,
    run_id: Uuid,
    max_urls: usize,
}

impl CrawlState {
    pub fn new(kv: Arc<dyn KvStore>, run_id: Uuid, max_urls: usize) -> Self {
        Self {
            kv,
            run_id,
            max_urls,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("crawl:{}:{}", self.run_id, suffix)
    }

    fn children_key(&self, parent: &str) -> String {
        self.key(&format!("children:{parent}"))
    }

    /// The fixed keys of a run's crawl state; per-page child sets are found
    /// through the `parents` set
    fn keys(run_id: Uuid) -> Vec<String> {
        ["known", "queued", "failed", "meta", "parents"]
            .iter()
            .map(|suffix| format!("crawl:{run_id}:{suffix}"))
            .collect()
    }

    /// Stores the run context; later calls leave the first value in place
    ///
    /// # Returns
    ///
    /// `true` if this call wrote the metadata
    pub async fn set_metadata(&self, metadata: &CrawlMetadata) -> StoreResult<bool> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| StoreError::Corrupt(format!("crawl metadata: {e}")))?;
        self.kv.set_if_absent(&self.key("meta"), &json, None).await
    }

    pub async fn metadata(&self) -> StoreResult<Option<CrawlMetadata>> {
        match self.kv.get(&self.key("meta")).await? {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("crawl metadata: {e}"))),
        }
    }

    /// Admits URLs the run has not seen yet, up to the run's URL cap
    ///
    /// Callers pass normalized URLs. Overlapping and concurrent calls never
    /// admit the same URL twice; URLs past the cap are dropped.
    ///
    /// # Returns
    ///
    /// Exactly the URLs this call admitted, in input order
    pub async fn queue_urls(&self, urls: &[String]) -> StoreResult<Vec<String>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        self.kv
            .add_new_members(
                &self.key("known"),
                urls,
                Some(self.max_urls),
                Some(&self.key("queued")),
            )
            .await
    }

    /// Admits the links found on `parent` and returns every link `parent`
    /// has admitted so far
    ///
    /// Admission and the per-page record happen in one call, so a page whose
    /// follow-up failed part way gets the same children back on retry instead
    /// of an empty list.
    pub async fn queue_children(
        &self,
        parent: &str,
        urls: &[String],
    ) -> StoreResult<Vec<String>> {
        let children = self.children_key(parent);
        self.kv
            .add_new_members(&self.key("parents"), &[parent.to_string()], None, None)
            .await?;
        if !urls.is_empty() {
            let known = self.key("known");
            self.kv
                .add_new_members(&known, urls, Some(self.max_urls), Some(&children))
                .await?;
        }

        let admitted = self.kv.members(&children).await?;
        if !admitted.is_empty() {
            self.kv
                .add_new_members(&self.key("queued"), &admitted, None, None)
                .await?;
        }
        Ok(admitted)
    }

    pub async fn get_queued_urls(&self) -> StoreResult<Vec<String>> {
        self.kv.members(&self.key("queued")).await
    }

    pub async fn mark_failed(&self, url: &str) -> StoreResult<()> {
        self.kv
            .add_new_members(&self.key("failed"), &[url.to_string()], None, None)
            .await?;
        Ok(())
    }

    pub async fn get_failed_urls(&self) -> StoreResult<Vec<String>> {
        self.kv.members(&self.key("failed")).await
    }

    pub async fn known_count(&self) -> StoreResult<usize> {
        self.kv.member_count(&self.key("known")).await
    }

    /// Deletes every key of this run's crawl state
    pub async fn cleanup(&self) -> StoreResult<usize> {
        let mut keys: Vec<String> = self
            .kv
            .members(&self.key("parents"))
            .await?
            .iter()
            .map(|parent| self.children_key(parent))
            .collect();
        keys.extend(Self::keys(self.run_id));
        self.kv.delete(&keys).await
    }
}
