//! Robots.txt parser implementation
//!
//! Consecutive `User-agent` lines open one group; `Allow`, `Disallow` and
//! `Crawl-delay` attach to the group opened last. `Sitemap` lines belong to
//! no group. Unknown directives and lines without a colon are ignored.

use crate::robots::matcher::resolve_rules;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Allow,
    Disallow,
}

/// One `Allow` or `Disallow` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotsRule {
    pub kind: RuleKind,
    pub pattern: String,
}

impl fmt::Display for RobotsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Allow => write!(f, "Allow: {}", self.pattern),
            RuleKind::Disallow => write!(f, "Disallow: {}", self.pattern),
        }
    }
}

/// Rules shared by one or more user agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAgentGroup {
    pub user_agents: Vec<String>,
    pub rules: Vec<RobotsRule>,
    pub crawl_delay: Option<f64>,
}

/// The outcome of checking one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotsDecision {
    pub allowed: bool,
    /// The rule that decided, if any matched
    pub matched_rule: Option<RobotsRule>,
}

/// A parsed robots.txt file plus how it was obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRobotsTxt {
    pub groups: Vec<UserAgentGroup>,
    pub sitemaps: Vec<String>,
    /// False when the file could not be fetched; such a file allows everything
    pub is_valid: bool,
    pub raw_content: String,
    pub fetched_at: DateTime<Utc>,
    pub fetch_error: Option<String>,
}

impl ParsedRobotsTxt {
    /// Parses raw robots.txt content
    ///
    /// # Arguments
    ///
    /// * `content` - The raw robots.txt file content
    ///
    /// # Returns
    ///
    /// A valid ParsedRobotsTxt; empty content yields zero groups
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<UserAgentGroup> = Vec::new();
        let mut sitemaps = Vec::new();
        // Whether the previous directive was a User-agent line
        let mut collecting_agents = false;

        for line in content.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            }
            .trim();

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !collecting_agents || groups.is_empty() {
                        groups.push(UserAgentGroup::default());
                    }
                    if let Some(group) = groups.last_mut() {
                        group.user_agents.push(value.to_string());
                    }
                    collecting_agents = true;
                }
                "allow" | "disallow" => {
                    collecting_agents = false;
                    let kind = if key == "allow" {
                        RuleKind::Allow
                    } else {
                        RuleKind::Disallow
                    };
                    if let Some(group) = groups.last_mut() {
                        group.rules.push(RobotsRule {
                            kind,
                            pattern: value.to_string(),
                        });
                    }
                }
                "crawl-delay" => {
                    collecting_agents = false;
                    if let (Some(group), Ok(delay)) = (groups.last_mut(), value.parse::<f64>()) {
                        if delay.is_finite() && delay >= 0.0 {
                            group.crawl_delay = Some(delay);
                        }
                    }
                }
                "sitemap" => {
                    if !value.is_empty() {
                        sitemaps.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        Self {
            groups,
            sitemaps,
            is_valid: true,
            raw_content: content.to_string(),
            fetched_at: Utc::now(),
            fetch_error: None,
        }
    }

    /// A permissive file, used when the site has no robots.txt
    pub fn allow_all() -> Self {
        Self::parse("")
    }

    /// A permissive file recording why the real one could not be fetched
    pub fn fetch_failed(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            fetch_error: Some(error.into()),
            ..Self::allow_all()
        }
    }

    /// Groups that apply to `user_agent`
    ///
    /// Groups naming the agent exactly (ignoring case) win; otherwise every
    /// `*` group applies. Empty when neither exists.
    pub fn groups_for(&self, user_agent: &str) -> Vec<&UserAgentGroup> {
        let named: Vec<&UserAgentGroup> = self
            .groups
            .iter()
            .filter(|g| g.user_agents.iter().any(|a| a.eq_ignore_ascii_case(user_agent)))
            .collect();
        if !named.is_empty() {
            return named;
        }
        self.groups
            .iter()
            .filter(|g| g.user_agents.iter().any(|a| a == "*"))
            .collect()
    }

    /// Checks a URL path (including any `?query`) for `user_agent`
    pub fn check(&self, path: &str, user_agent: &str) -> RobotsDecision {
        if !self.is_valid {
            return RobotsDecision {
                allowed: true,
                matched_rule: None,
            };
        }

        let groups = self.groups_for(user_agent);
        let matched = resolve_rules(path, groups.iter().flat_map(|g| g.rules.iter()));

        RobotsDecision {
            allowed: matched.map_or(true, |rule| rule.kind == RuleKind::Allow),
            matched_rule: matched.cloned(),
        }
    }

    pub fn is_allowed(&self, path: &str, user_agent: &str) -> bool {
        self.check(path, user_agent).allowed
    }

    /// Gets the crawl delay in seconds for `user_agent`, if specified
    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        self.groups_for(user_agent)
            .into_iter()
            .find_map(|g| g.crawl_delay)
    }
}
