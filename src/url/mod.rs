//! URL handling for crawl-ingest
//!
//! Normalization gives every discovered URL one canonical spelling before it
//! reaches the per-run dedup set; origins key the robots.txt cache; a
//! [`SiteScope`] decides which links a domain-mode crawl may follow.

mod normalize;

pub use normalize::normalize_url;

use url::Url;

/// Extracts the lowercase host of a URL
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Returns `scheme://host[:port]`, the unit robots.txt applies to
///
/// ```
/// use url::Url;
/// use crawl_ingest::url::origin_of;
///
/// let url = Url::parse("https://Example.com:8443/a/b?c=d").unwrap();
/// assert_eq!(origin_of(&url).as_deref(), Some("https://example.com:8443"));
/// ```
pub fn origin_of(url: &Url) -> Option<String> {
    let host = extract_domain(url)?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Checks a host against a domain pattern
///
/// `example.com` matches only itself; `*.example.com` matches the bare domain
/// and any subdomain depth. Comparison ignores ASCII case.
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let candidate = candidate.to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || candidate
                    .strip_suffix(base)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => candidate == pattern,
    }
}

/// The set of hosts a domain-mode crawl stays within
#[derive(Debug, Clone, Default)]
pub struct SiteScope {
    hosts: Vec<String>,
    patterns: Vec<String>,
}

impl SiteScope {
    /// Builds a scope from the seed URLs' hosts plus extra wildcard patterns
    pub fn new<'a>(seeds: impl IntoIterator<Item = &'a Url>, patterns: &[String]) -> Self {
        let mut hosts: Vec<String> = seeds.into_iter().filter_map(extract_domain).collect();
        hosts.sort();
        hosts.dedup();

        Self {
            hosts,
            patterns: patterns.to_vec(),
        }
    }

    pub fn contains(&self, url: &Url) -> bool {
        let Some(host) = extract_domain(url) else {
            return false;
        };

        self.hosts.iter().any(|h| *h == host)
            || self.patterns.iter().any(|p| matches_wildcard(p, &host))
    }
}
