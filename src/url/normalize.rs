//! URL normalization
//!
//! Every URL entering a run's frontier goes through [`normalize_url`] first,
//! so the dedup set and the page store agree on one spelling per resource.

use crate::UrlError;
use url::Url;

/// Query keys that only identify where a click came from
const TRACKING_KEYS: &[&str] = &["fbclid", "gclid", "mc_eid", "ref", "source"];

/// Any key with this prefix is dropped as well
const TRACKING_PREFIX: &str = "utm_";

/// Normalizes a URL so equivalent spellings share one dedup key
///
/// The scheme must be `http` or `https`. The host is lowercased, empty and
/// dot path segments are resolved, the fragment is dropped, tracking
/// parameters are removed and the remaining query pairs are sorted by key.
/// A trailing slash is kept: `/docs/` and `/docs` may be different resources,
/// and robots.txt rules distinguish them.
///
/// # Examples
///
/// ```
/// use crawl_ingest::url::normalize_url;
///
/// let url = normalize_url("https://EXAMPLE.COM/a/../docs/?utm_source=x#top").unwrap();
/// assert_eq!(url.as_str(), "https://example.com/docs/");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlError::InvalidScheme(other.to_string())),
    }

    let host = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or(UrlError::MissingDomain)?;
    url.set_host(Some(&host))
        .map_err(|e| UrlError::Malformed(format!("bad host {host}: {e}")))?;

    let path = clean_path(url.path());
    url.set_path(&path);
    url.set_fragment(None);

    let kept = kept_query_pairs(&url);
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(url)
}

/// Resolves `.`/`..` and collapses empty segments, preserving a trailing slash
fn clean_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }

    if stack.is_empty() {
        return "/".to_string();
    }
    let trailing = if path.ends_with('/') { "/" } else { "" };
    format!("/{}{}", stack.join("/"), trailing)
}

fn kept_query_pairs(url: &Url) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_key(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

fn is_tracking_key(key: &str) -> bool {
    key.starts_with(TRACKING_PREFIX) || TRACKING_KEYS.contains(&key)
}
