//! Integration tests for robots.txt filtering against a live mock server

use crawl_ingest::config::RobotsConfig;
use crawl_ingest::robots::{
    BlockReason, MemoryRobotsCache, RobotsCache, RobotsEngine, RobotsOverride,
};
use crawl_ingest::storage::MemoryKvStore;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine(enabled: bool) -> RobotsEngine {
    engine_with_timeout(enabled, 2000)
}

fn engine_with_timeout(enabled: bool, fetch_timeout_ms: u64) -> RobotsEngine {
    RobotsEngine::new(
        reqwest::Client::new(),
        RobotsCache::new(Arc::new(MemoryKvStore::new()), Duration::from_secs(3600))
            .with_memory_tier(MemoryRobotsCache::new(Duration::from_secs(60))),
        &RobotsConfig {
            enabled,
            fetch_timeout_ms,
            ..RobotsConfig::default()
        },
        "TestBot",
    )
}

async fn serve_robots(server: &MockServer, response: ResponseTemplate, expected_hits: u64) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(response)
        .expect(expected_hits)
        .mount(server)
        .await;
}

fn urls(server: &MockServer, paths: &[&str]) -> Vec<String> {
    paths
        .iter()
        .map(|p| format!("{}{}", server.uri(), p))
        .collect()
}

#[tokio::test]
async fn test_missing_robots_txt_allows_everything() {
    let server = MockServer::start().await;
    serve_robots(&server, ResponseTemplate::new(404), 1).await;

    let targets = urls(&server, &["/", "/admin", "/a/b?c=d"]);
    let result = engine(true).filter_urls_by_robots_rules(&targets, true).await;

    assert_eq!(result.allowed, targets);
    assert!(result.blocked.is_empty());
    assert_eq!(result.domains_fetched, 1);
    assert_eq!(result.override_applied, None);
}

#[tokio::test]
async fn test_server_error_fails_open_and_records_error() {
    let server = MockServer::start().await;
    serve_robots(&server, ResponseTemplate::new(500), 1).await;
    let engine = engine(true);

    let targets = urls(&server, &["/private", "/public"]);
    let result = engine.filter_urls_by_robots_rules(&targets, true).await;
    assert_eq!(result.allowed, targets);

    // The failure is held in the in-process tier; the mock expects one request
    let robots = engine.fetch_robots_txt(&server.uri()).await;
    assert!(!robots.is_valid);
    assert_eq!(robots.fetch_error.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn test_slow_robots_txt_times_out_and_fails_open() {
    let server = MockServer::start().await;
    serve_robots(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("User-agent: *\nDisallow: /\n")
            .set_delay(Duration::from_millis(1500)),
        1,
    )
    .await;
    let engine = engine_with_timeout(true, 200);

    let targets = urls(&server, &["/private", "/public"]);
    let result = engine.filter_urls_by_robots_rules(&targets, true).await;
    assert_eq!(result.allowed, targets);
    assert!(result.blocked.is_empty());

    let robots = engine.fetch_robots_txt(&server.uri()).await;
    assert!(!robots.is_valid);
    assert!(robots.fetch_error.is_some());
}

#[tokio::test]
async fn test_unreachable_origin_fails_open() {
    // Nothing listens on the port once the server is dropped
    let origin = MockServer::start().await.uri();
    let engine = engine(true);

    let targets = vec![format!("{origin}/a")];
    let result = engine.filter_urls_by_robots_rules(&targets, true).await;
    assert_eq!(result.allowed, targets);

    let robots = engine.fetch_robots_txt(&origin).await;
    assert!(!robots.is_valid);
    assert!(robots.fetch_error.is_some());
}

#[tokio::test]
async fn test_overrides_skip_fetching() {
    let server = MockServer::start().await;
    serve_robots(
        &server,
        ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"),
        0,
    )
    .await;
    let targets = urls(&server, &["/a", "/b"]);

    let global = engine(false).filter_urls_by_robots_rules(&targets, true).await;
    assert_eq!(global.allowed, targets);
    assert_eq!(global.override_applied, Some(RobotsOverride::GlobalDisabled));
    assert_eq!(global.domains_fetched, 0);

    let source = engine(true).filter_urls_by_robots_rules(&targets, false).await;
    assert_eq!(source.allowed, targets);
    assert_eq!(source.override_applied, Some(RobotsOverride::SourceDisabled));
    assert_eq!(source.domains_fetched, 0);
}

#[tokio::test]
async fn test_longer_allow_beats_disallow() {
    let server = MockServer::start().await;
    serve_robots(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("User-agent: *\nDisallow: /docs\nAllow: /docs/public\n"),
        1,
    )
    .await;

    let targets = urls(&server, &["/docs/public/guide", "/docs/internal", "/blog"]);
    let result = engine(true).filter_urls_by_robots_rules(&targets, true).await;

    assert_eq!(result.allowed, vec![targets[0].clone(), targets[2].clone()]);
    assert_eq!(result.blocked.len(), 1);
    let blocked = &result.blocked[0];
    assert_eq!(blocked.url, targets[1]);
    assert_eq!(blocked.reason, BlockReason::Disallowed);
    assert_eq!(blocked.matched_rule.as_deref(), Some("Disallow: /docs"));
}

#[tokio::test]
async fn test_named_group_wins_over_wildcard() {
    let server = MockServer::start().await;
    serve_robots(
        &server,
        ResponseTemplate::new(200).set_body_string(
            "User-agent: *\nAllow: /\n\nUser-agent: TestBot\nDisallow: /drafts\nCrawl-delay: 2\n",
        ),
        1,
    )
    .await;
    let engine = engine(true);

    let targets = urls(&server, &["/drafts/1", "/posts/1"]);
    let result = engine.filter_urls_by_robots_rules(&targets, true).await;
    assert_eq!(result.allowed, vec![targets[1].clone()]);

    assert_eq!(
        engine.crawl_delay(&server.uri()).await,
        Some(Duration::from_secs(2))
    );
}

#[tokio::test]
async fn test_malformed_urls_are_blocked_without_fetching() {
    let server = MockServer::start().await;
    serve_robots(&server, ResponseTemplate::new(404), 0).await;

    let targets = vec!["not a url".to_string(), "ftp://example.com/file".to_string()];
    let result = engine(true).filter_urls_by_robots_rules(&targets, true).await;

    assert!(result.allowed.is_empty());
    assert_eq!(result.domains_fetched, 0);
    assert!(result
        .blocked
        .iter()
        .all(|b| b.reason == BlockReason::MalformedUrl));
}
