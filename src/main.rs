//! crawl-ingest main entry point
//!
//! Runs every configured source through the staged ingestion pipeline.

use anyhow::Context;
use clap::Parser;
use crawl_ingest::config::{load_config_with_hash, Config, SourceEntry};
use crawl_ingest::crawler::build_http_client;
use crawl_ingest::pipeline::{
    FairnessScheduler, HashingEmbedder, JobProcessor, JobQueue, MemoryJobQueue,
    MemoryVectorStore, Stores, WorkerPool,
};
use crawl_ingest::robots::{MemoryRobotsCache, RobotsCache, RobotsEngine};
use crawl_ingest::state::{NewRun, Source};
use crawl_ingest::storage::{KvStore, MemoryKvStore, SqliteStore};
use crawl_ingest::url::origin_of;
use crawl_ingest::Run;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

/// How often the CLI checks whether its runs have finished
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// crawl-ingest: staged ingestion of crawled web content
///
/// Each configured source gets one run that is discovered, scraped,
/// processed, indexed and embedded by a pool of workers, respecting
/// robots.txt and sharing fetch capacity fairly between runs.
#[derive(Parser, Debug)]
#[command(name = "crawl-ingest")]
#[command(version)]
#[command(about = "A staged ingestion pipeline for crawled web content", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be ingested without running anything
    #[arg(long, conflicts_with_all = ["stats", "check_robots"])]
    dry_run: bool,

    /// Show recent runs from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "check_robots"])]
    stats: bool,

    /// Check URLs against their robots.txt and exit
    #[arg(long, value_name = "URL", num_args = 1.., conflicts_with_all = ["dry_run", "stats"])]
    check_robots: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config).await?;
    } else if !cli.check_robots.is_empty() {
        handle_check_robots(&config, &cli.check_robots).await?;
    } else {
        handle_ingest(config, config_hash).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("crawl_ingest=info,warn"),
            1 => EnvFilter::new("crawl_ingest=debug,info"),
            2 => EnvFilter::new("crawl_ingest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would run
fn handle_dry_run(config: &Config) {
    println!("=== crawl-ingest Dry Run ===\n");

    println!("Pipeline:");
    println!("  Workers: {}", config.pipeline.worker_count);
    println!("  Max job attempts: {}", config.pipeline.max_job_attempts);
    println!(
        "  Chunks: {} chars, {} overlap",
        config.pipeline.chunk_size, config.pipeline.chunk_overlap
    );
    println!("  Embedding dimensions: {}", config.embedding.dimensions);

    println!("\nFairness:");
    if config.fairness.enabled {
        println!(
            "  {} slots, {}..{} per run",
            config.fairness.total_slots,
            config.fairness.min_slots_per_run,
            config.fairness.max_slots_per_run
        );
    } else {
        println!("  disabled");
    }

    println!("\nRobots.txt:");
    println!(
        "  {}",
        if config.robots.enabled {
            "enforced"
        } else {
            "ignored (global override)"
        }
    );

    println!("\nUser Agent:");
    println!("  Name: {}", config.user_agent.crawler_name);
    println!("  Version: {}", config.user_agent.crawler_version);
    println!("  Contact URL: {}", config.user_agent.contact_url);
    println!("  Contact Email: {}", config.user_agent.contact_email);

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    println!("\nSources ({}):", config.sources.len());
    for source in &config.sources {
        println!(
            "  - {}/{} ({}, up to {} URLs{})",
            source.tenant,
            source.name,
            source.mode.as_str(),
            source.max_urls,
            if source.respect_robots_txt {
                ""
            } else {
                ", robots.txt ignored"
            }
        );
        for url in &source.urls {
            println!("    * {}", url);
        }
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows recent runs from the database
async fn handle_stats(config: &Config) -> anyhow::Result<()> {
    use crawl_ingest::storage::RunStore;

    println!("Database: {}\n", config.output.database_path);
    let store = SqliteStore::new(Path::new(&config.output.database_path))?;
    let runs = store.list_runs(20).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

fn print_run(run: &Run) {
    println!(
        "{}  {:<9} {:<11} seen {:>5}  indexed {:>5}  failed {:>4}  skipped {:>4}  chunks {}/{}  units failed {}",
        run.id,
        run.status.to_string(),
        run.stage.to_string(),
        run.stats.pages_seen,
        run.stats.pages_indexed,
        run.stats.pages_failed,
        run.stats.pages_skipped,
        run.stats.chunks_embedded,
        run.stats.chunks_to_embed,
        run.stats.units_failed
    );
}

fn robots_engine(config: &Config, client: reqwest::Client, kv: Arc<dyn KvStore>) -> RobotsEngine {
    let cache = RobotsCache::new(kv, Duration::from_secs(config.robots.cache_ttl_seconds))
        .with_memory_tier(MemoryRobotsCache::new(Duration::from_secs(
            config.robots.memory_cache_ttl_seconds,
        )));
    RobotsEngine::new(
        client,
        cache,
        &config.robots,
        config.user_agent.crawler_name.clone(),
    )
}

/// Handles the --check-robots mode
async fn handle_check_robots(config: &Config, urls: &[String]) -> anyhow::Result<()> {
    let client = build_http_client(&config.user_agent)?;
    let engine = robots_engine(config, client, Arc::new(MemoryKvStore::new()));

    for url in urls {
        match engine.check_url(url).await {
            Ok(decision) => println!(
                "{} {}{}",
                if decision.allowed { "ALLOW" } else { "BLOCK" },
                url,
                decision
                    .matched_rule
                    .map(|rule| format!("  ({rule})"))
                    .unwrap_or_default()
            ),
            Err(blocked) => {
                println!("BLOCK {}  ({})", url, blocked.reason);
                continue;
            }
        }
        let origin = Url::parse(url).ok().and_then(|u| origin_of(&u));
        if let Some(origin) = origin {
            if let Some(delay) = engine.crawl_delay(&origin).await {
                println!("      crawl-delay: {:?}", delay);
            }
        }
    }
    Ok(())
}

/// Creates the stored copy of a configured source, or refreshes it
async fn ensure_source(stores: &Stores, entry: &SourceEntry) -> anyhow::Result<Source> {
    let fresh = Source::from_entry(entry);
    let source = match stores.sources.find_source(&entry.tenant, &entry.name).await? {
        Some(existing) => Source {
            id: existing.id,
            ..fresh
        },
        None => fresh,
    };
    stores.sources.save_source(&source).await?;
    Ok(source)
}

/// Handles the main ingest operation
async fn handle_ingest(config: Config, config_hash: String) -> anyhow::Result<()> {
    if config.sources.is_empty() {
        tracing::warn!("No sources configured; nothing to do");
        return Ok(());
    }

    let db = Arc::new(
        SqliteStore::new(Path::new(&config.output.database_path))
            .with_context(|| format!("Failed to open {}", config.output.database_path))?,
    );
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let stores = Stores::sqlite(db, kv.clone());
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
    let fairness = Arc::new(FairnessScheduler::new(kv.clone(), config.fairness.clone()));
    let client = build_http_client(&config.user_agent)?;
    let robots = Arc::new(robots_engine(&config, client.clone(), kv));

    let processor = JobProcessor::new(
        stores.clone(),
        queue.clone(),
        fairness,
        robots,
        client,
        config.pipeline.clone(),
    )
    .with_embedder(Arc::new(HashingEmbedder::new(config.embedding.dimensions)))
    .with_vector_store(Arc::new(MemoryVectorStore::new()));
    let manager = processor.manager();
    let pool = WorkerPool::spawn(queue, Arc::new(processor));

    let mut run_ids = Vec::new();
    for entry in &config.sources {
        let source = ensure_source(&stores, entry).await?;
        let run = stores
            .runs
            .create_run(NewRun {
                source_id: source.id,
                tenant_id: source.tenant_id.clone(),
                force_reindex: entry.force_reindex,
                embedding_dimensions: Some(config.embedding.dimensions),
                config_hash: Some(config_hash.clone()),
            })
            .await?;
        manager.start_run(run.id).await?;
        tracing::info!("Run {} started for {}/{}", run.id, source.tenant_id, source.name);
        run_ids.push(run.id);
    }

    tokio::select! {
        result = wait_for_runs(&stores, &run_ids) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, canceling {} runs", run_ids.len());
            for run_id in &run_ids {
                manager.cancel_run(*run_id).await?;
            }
        }
    }
    pool.shutdown().await;

    println!();
    for run_id in &run_ids {
        if let Some(run) = stores.runs.get_run(*run_id).await? {
            print_run(&run);
        }
    }
    Ok(())
}

/// Resolves once every run has reached a terminal status
async fn wait_for_runs(stores: &Stores, run_ids: &[Uuid]) -> anyhow::Result<()> {
    loop {
        let mut finished = 0;
        for run_id in run_ids {
            let run = stores
                .runs
                .get_run(*run_id)
                .await?
                .with_context(|| format!("Run {run_id} disappeared"))?;
            if run.status.is_terminal() {
                finished += 1;
            }
        }
        if finished == run_ids.len() {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
