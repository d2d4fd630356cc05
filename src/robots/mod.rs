//! Robots.txt handling module
//!
//! This module fetches, parses and caches robots.txt files and answers
//! whether URLs may be crawled. Fetch problems never block a crawl: a missing
//! file allows everything, and any other failure is recorded and also allows
//! everything.

mod cache;
mod matcher;
mod parser;

pub use cache::{MemoryRobotsCache, RobotsCache};
pub use matcher::{match_robots_txt_pattern, resolve_rules};
pub use parser::{ParsedRobotsTxt, RobotsDecision, RobotsRule, RuleKind, UserAgentGroup};

use crate::config::RobotsConfig;
use crate::url::origin_of;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Why a URL was filtered out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// A disallow rule matched
    Disallowed,
    /// The URL could not be parsed or has no host
    MalformedUrl,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disallowed => f.write_str("disallowed by robots.txt"),
            Self::MalformedUrl => f.write_str("malformed URL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedUrl {
    pub url: String,
    pub reason: BlockReason,
    /// The deciding rule, e.g. `Disallow: /private/`
    pub matched_rule: Option<String>,
}

/// Which switch bypassed robots.txt enforcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsOverride {
    GlobalDisabled,
    SourceDisabled,
}

/// Result of filtering a batch of URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsFilterResult {
    /// Allowed URLs in input order
    pub allowed: Vec<String>,
    pub blocked: Vec<BlockedUrl>,
    pub override_applied: Option<RobotsOverride>,
    /// Distinct origins whose robots.txt was consulted
    pub domains_fetched: usize,
}

/// Answers allow/deny questions for one crawler identity
pub struct RobotsEngine {
    client: Client,
    cache: RobotsCache,
    enabled: bool,
    fetch_timeout: Duration,
    user_agent: String,
}

impl RobotsEngine {
    /// Creates an engine
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client used for robots.txt requests
    /// * `cache` - Cache consulted before every fetch
    /// * `config` - Kill-switch and fetch timeout
    /// * `user_agent` - Product token matched against `User-agent` lines
    pub fn new(
        client: Client,
        cache: RobotsCache,
        config: &RobotsConfig,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cache,
            enabled: config.enabled,
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            user_agent: user_agent.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the robots.txt of `origin`, from cache or the network
    ///
    /// Never fails; see the module docs for how fetch problems are mapped.
    pub async fn fetch_robots_txt(&self, origin: &str) -> ParsedRobotsTxt {
        if let Some(cached) = self.cache.get(origin).await {
            return cached;
        }

        let robots = self.fetch_uncached(origin).await;
        self.cache.put(origin, &robots).await;
        robots
    }

    async fn fetch_uncached(&self, origin: &str) -> ParsedRobotsTxt {
        let robots_url = format!("{origin}/robots.txt");
        debug!("Fetching {}", robots_url);

        let response = match self
            .client
            .get(&robots_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("robots.txt fetch failed for {}, allowing: {}", origin, e);
                return ParsedRobotsTxt::fetch_failed(e.to_string());
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return ParsedRobotsTxt::allow_all();
        }
        if !status.is_success() {
            warn!("robots.txt for {} returned HTTP {}, allowing", origin, status);
            return ParsedRobotsTxt::fetch_failed(format!("HTTP {}", status.as_u16()));
        }

        match response.text().await {
            Ok(body) => ParsedRobotsTxt::parse(&body),
            Err(e) => {
                warn!("robots.txt body unreadable for {}, allowing: {}", origin, e);
                ParsedRobotsTxt::fetch_failed(e.to_string())
            }
        }
    }

    /// Checks one URL
    pub async fn check_url(&self, url: &str) -> Result<RobotsDecision, BlockedUrl> {
        let (parsed, origin) = parse_target(url)?;
        let robots = self.fetch_robots_txt(&origin).await;
        Ok(robots.check(&robot_path(&parsed), &self.user_agent))
    }

    /// Crawl delay the origin asks of this crawler
    pub async fn crawl_delay(&self, origin: &str) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        self.fetch_robots_txt(origin)
            .await
            .crawl_delay(&self.user_agent)
            .map(Duration::from_secs_f64)
    }

    /// Sitemap URLs listed by the origin's robots.txt
    pub async fn sitemaps(&self, origin: &str) -> Vec<String> {
        self.fetch_robots_txt(origin).await.sitemaps
    }

    /// Partitions `urls` into allowed and blocked
    ///
    /// A disabled engine or `respect_robots_txt == false` allows everything
    /// without fetching. Otherwise each origin's robots.txt is looked up once.
    pub async fn filter_urls_by_robots_rules(
        &self,
        urls: &[String],
        respect_robots_txt: bool,
    ) -> RobotsFilterResult {
        let override_applied = if !self.enabled {
            Some(RobotsOverride::GlobalDisabled)
        } else if !respect_robots_txt {
            Some(RobotsOverride::SourceDisabled)
        } else {
            None
        };
        if override_applied.is_some() {
            return RobotsFilterResult {
                allowed: urls.to_vec(),
                override_applied,
                ..RobotsFilterResult::default()
            };
        }

        let mut result = RobotsFilterResult::default();
        let mut by_origin: HashMap<String, ParsedRobotsTxt> = HashMap::new();

        for url in urls {
            let (parsed, origin) = match parse_target(url) {
                Ok(target) => target,
                Err(blocked) => {
                    result.blocked.push(blocked);
                    continue;
                }
            };

            if !by_origin.contains_key(&origin) {
                let robots = self.fetch_robots_txt(&origin).await;
                by_origin.insert(origin.clone(), robots);
            }
            let Some(robots) = by_origin.get(&origin) else {
                continue;
            };

            let decision = robots.check(&robot_path(&parsed), &self.user_agent);
            if decision.allowed {
                result.allowed.push(url.clone());
            } else {
                result.blocked.push(BlockedUrl {
                    url: url.clone(),
                    reason: BlockReason::Disallowed,
                    matched_rule: decision.matched_rule.map(|r| r.to_string()),
                });
            }
        }

        result.domains_fetched = by_origin.len();
        debug!(
            "robots filter: {} allowed, {} blocked across {} domains",
            result.allowed.len(),
            result.blocked.len(),
            result.domains_fetched
        );
        result
    }
}

fn parse_target(url: &str) -> Result<(Url, String), BlockedUrl> {
    let malformed = || BlockedUrl {
        url: url.to_string(),
        reason: BlockReason::MalformedUrl,
        matched_rule: None,
    };
    let parsed = Url::parse(url).map_err(|_| malformed())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(malformed());
    }
    let origin = origin_of(&parsed).ok_or_else(malformed)?;
    Ok((parsed, origin))
}

/// The part of a URL robots.txt rules are matched against
fn robot_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robot_path_includes_query() {
        let url = Url::parse("https://example.com/search?q=rust#frag").unwrap();
        assert_eq!(robot_path(&url), "/search?q=rust");
    }

    #[test]
    fn test_malformed_targets_are_blocked() {
        for bad in ["not a url", "mailto:someone@example.com", "file:///etc/passwd"] {
            let blocked = parse_target(bad).unwrap_err();
            assert_eq!(blocked.reason, BlockReason::MalformedUrl);
        }
    }
}
