use serde::{Deserialize, Serialize};

/// Main configuration structure for crawl-ingest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fairness: FairnessConfig,
    #[serde(default)]
    pub robots: RobotsConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceEntry>,
}

/// Worker pool and job fan-out settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent workers pulling from the job queue
    #[serde(rename = "worker-count")]
    pub worker_count: usize,

    /// Jobs handed to the queue per enqueue call
    #[serde(rename = "enqueue-batch-size")]
    pub enqueue_batch_size: usize,

    /// Chunks embedded per embed-batch job
    #[serde(rename = "embed-batch-size")]
    pub embed_batch_size: usize,

    /// Attempts per job before a retryable failure is recorded as final
    #[serde(rename = "max-job-attempts")]
    pub max_job_attempts: u32,

    /// Base delay of the exponential retry backoff (milliseconds)
    #[serde(rename = "retry-backoff-ms")]
    pub retry_backoff_ms: u64,

    /// Characters per chunk
    #[serde(rename = "chunk-size")]
    pub chunk_size: usize,

    /// Characters shared between consecutive chunks
    #[serde(rename = "chunk-overlap")]
    pub chunk_overlap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            enqueue_batch_size: 100,
            embed_batch_size: 32,
            max_job_attempts: 3,
            retry_backoff_ms: 500,
            chunk_size: 1200,
            chunk_overlap: 200,
        }
    }
}

/// Admission control over concurrent fetch capacity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    pub enabled: bool,

    /// Global number of concurrent fetches across all runs
    #[serde(rename = "total-slots")]
    pub total_slots: u32,

    /// Allowance every registered run is guaranteed
    #[serde(rename = "min-slots-per-run")]
    pub min_slots_per_run: u32,

    /// Allowance no run may exceed
    #[serde(rename = "max-slots-per-run")]
    pub max_slots_per_run: u32,

    /// Lifetime of a held slot if its worker never releases it
    #[serde(rename = "slot-ttl-seconds")]
    pub slot_ttl_seconds: u64,

    /// Backoff hint returned on denial
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            total_slots: 20,
            min_slots_per_run: 1,
            max_slots_per_run: 10,
            slot_ttl_seconds: 120,
            retry_delay_ms: 1000,
        }
    }
}

/// robots.txt enforcement
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RobotsConfig {
    /// Global kill-switch; false allows every URL without fetching anything
    pub enabled: bool,

    #[serde(rename = "fetch-timeout-ms")]
    pub fetch_timeout_ms: u64,

    /// TTL of the shared cache tier
    #[serde(rename = "cache-ttl-seconds")]
    pub cache_ttl_seconds: u64,

    /// TTL of the in-process cache tier
    #[serde(rename = "memory-cache-ttl-seconds")]
    pub memory_cache_ttl_seconds: u64,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_timeout_ms: 5000,
            cache_ttl_seconds: 24 * 60 * 60,
            memory_cache_ttl_seconds: 5 * 60,
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler, also the robots.txt product token
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Vector width produced by the embedder
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

/// How a source finds its URLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Exactly the configured URLs
    List,
    /// Configured seeds plus same-site links found while scraping
    Domain,
    /// URLs listed by sitemaps: `.xml` URLs are read directly, site URLs
    /// contribute the sitemaps their robots.txt names
    Sitemap,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Domain => "domain",
            Self::Sitemap => "sitemap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Self::List),
            "domain" => Some(Self::Domain),
            "sitemap" => Some(Self::Sitemap),
            _ => None,
        }
    }
}

/// A crawl source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub name: String,

    #[serde(default = "default_tenant")]
    pub tenant: String,

    pub mode: SourceMode,

    /// Seeds, explicit URLs, or the sitemap URL depending on mode
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(rename = "max-urls", default = "default_max_urls")]
    pub max_urls: usize,

    #[serde(rename = "respect-robots-txt", default = "default_true")]
    pub respect_robots_txt: bool,

    /// Extra domain patterns domain-mode crawls may follow (e.g. "*.example.com")
    #[serde(rename = "allowed-domains", default)]
    pub allowed_domains: Vec<String>,

    #[serde(rename = "force-reindex", default)]
    pub force_reindex: bool,
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_max_urls() -> usize {
    500
}

fn default_true() -> bool {
    true
}
