//! crawl-ingest: a staged ingestion pipeline for crawled web content
//!
//! A run moves a source through six fixed stages (discovering, scraping,
//! processing, indexing, embedding, completed). Work inside a stage is fanned
//! out as jobs to a pool of workers; workers coordinate only through atomic
//! store primitives, so any number of them can cooperate on the same run while
//! jobs are delivered at least once.

pub mod config;
pub mod crawler;
pub mod pipeline;
pub mod robots;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("Store error: {0}")]
    Store(#[from] storage::StoreError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("Fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Queue error: {0}")]
    Queue(String),
}

impl IngestError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the job queue should spend another attempt on this error.
    ///
    /// Only missing records, missing configuration and malformed payloads are
    /// excluded; everything else is treated as transient infrastructure.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotFound { .. }
                | Self::NotConfigured(_)
                | Self::InvalidPayload(_)
                | Self::Config(_)
                | Self::Url(_)
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid domain pattern: {0}")]
    InvalidPattern(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use pipeline::{StageJobQueuer, StageManager};
pub use state::{Run, RunStatus, Stage};
pub use url::{extract_domain, normalize_url};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!IngestError::not_found("run", "abc").is_retryable());
        assert!(!IngestError::NotConfigured("vector store".into()).is_retryable());
    }

    #[test]
    fn test_infrastructure_errors_are_retryable() {
        let err = IngestError::Store(storage::StoreError::Unavailable("down".into()));
        assert!(err.is_retryable());
        assert!(IngestError::Embedding("rate limited".into()).is_retryable());
        assert!(IngestError::Http {
            url: "https://example.com".into(),
            status: 503
        }
        .is_retryable());
    }
}
