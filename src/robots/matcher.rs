//! robots.txt path pattern matching and rule resolution

use crate::robots::parser::{RobotsRule, RuleKind};

/// Matches a URL path (with query) against a robots.txt pattern
///
/// Patterns are prefix matches. `*` matches any run of characters and a
/// trailing `$` anchors the pattern to the end of the path. An empty pattern
/// matches nothing.
///
/// ```
/// use crawl_ingest::robots::match_robots_txt_pattern;
///
/// assert!(match_robots_txt_pattern("/private/secret/file.html", "/private/*/"));
/// assert!(match_robots_txt_pattern("/exact", "/exact$"));
/// assert!(!match_robots_txt_pattern("/exact/more", "/exact$"));
/// assert!(!match_robots_txt_pattern("/any/path", ""));
/// ```
pub fn match_robots_txt_pattern(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(body) => (body, true),
        None => (pattern, false),
    };

    let mut parts = body.split('*');
    let first = parts.next().unwrap_or_default();
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();

    let rest: Vec<&str> = parts.collect();
    let Some((last, middle)) = rest.split_last() else {
        return !anchored || pos == path.len();
    };

    // Leftmost placement of each literal leaves the most room for the rest
    for part in middle {
        match path[pos..].find(part) {
            Some(offset) => pos += offset + part.len(),
            None => return false,
        }
    }

    if anchored {
        path.len() >= pos + last.len() && path.ends_with(last)
    } else {
        path[pos..].contains(last)
    }
}

/// Picks the rule that decides `path`
///
/// The longest matching pattern wins; on equal length an allow rule beats a
/// disallow rule. `None` means no rule matched and the path is allowed.
pub fn resolve_rules<'a>(
    path: &str,
    rules: impl IntoIterator<Item = &'a RobotsRule>,
) -> Option<&'a RobotsRule> {
    rules
        .into_iter()
        .filter(|rule| match_robots_txt_pattern(path, &rule.pattern))
        .max_by(|a, b| {
            a.pattern
                .len()
                .cmp(&b.pattern.len())
                .then_with(|| (a.kind == RuleKind::Allow).cmp(&(b.kind == RuleKind::Allow)))
        })
}
