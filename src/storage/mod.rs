//! Storage for pipeline state
//!
//! Two families of stores live here:
//! - Durable stores (runs, sources, pages, chunks) behind the traits in
//!   [`traits`], implemented on SQLite by [`SqliteStore`]
//! - The atomic key-value store behind [`KvStore`], holding every piece of
//!   ephemeral per-run state shared between workers

mod kv;
mod memory;
mod schema;
mod sqlite;
mod traits;

pub use kv::{KvStore, LeaseDenial, LeaseOutcome, LeaseRequest};
pub use memory::MemoryKvStore;
pub use sqlite::SqliteStore;
pub use traits::{ChunkStore, PageStore, RunStore, SourceStore};

use crate::state::PageState;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Key {0} holds a value of a different type")]
    WrongType(String),

    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A page fetched during a run
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub run_id: Uuid,
    pub url: String,
    pub state: PageState,
    pub status_code: Option<u16>,
    pub html: Option<String>,
    /// Extracted plain text
    pub text: Option<String>,
    /// SHA-256 of the extracted text, hex encoded
    pub content_hash: Option<String>,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk of extracted page text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub url: String,
    pub index: usize,
    pub content: String,
    pub embedded: bool,
}

/// Chunk text awaiting insertion
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub index: usize,
    pub content: String,
}

/// Page counts by final state, used when finalizing a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub total: u64,
    pub indexed: u64,
    pub failed: u64,
    pub unchanged: u64,
}

/// Counts of a run's live (not soft-deleted) chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub active: u64,
    pub embedded: u64,
}
