//! HTML and sitemap parsing
//!
//! This module handles parsing fetched documents to extract:
//! - Links to follow (from <a> tags and canonical links)
//! - Page title and readable text
//! - `<loc>` entries of sitemap XML

use scraper::{Html, Selector};
use url::Url;

/// Extracted information from an HTML page
#[derive(Debug, Clone)]
pub struct ParsedPage {
    /// The page title (from <title> tag)
    pub title: Option<String>,

    /// All links found on the page (absolute URLs)
    pub links: Vec<String>,

    /// Visible body text with whitespace collapsed
    pub text: String,
}

/// Parses HTML content and extracts links, title and text
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href="...">` tags
/// - `<link rel="canonical" href="...">`
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` links
/// - Data URIs and fragment-only links
///
/// # Example
///
/// ```
/// use crawl_ingest::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title, Some("Test".to_string()));
/// assert_eq!(parsed.links, vec!["https://example.com/page".to_string()]);
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        links: extract_links(&document, base_url),
        text: extract_text(&document),
    }
}

/// Extracts the page title from the HTML document
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extracts all valid links from the HTML document
fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(absolute_url) = element
                .value()
                .attr("href")
                .and_then(|href| resolve_link(href, base_url))
            {
                links.push(absolute_url);
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&canonical_selector) {
            if let Some(absolute_url) = element
                .value()
                .attr("href")
                .and_then(|href| resolve_link(href, base_url))
            {
                links.push(absolute_url);
            }
        }
    }

    links
}

const NON_CONTENT_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Collects the text of `<body>` (or the whole document when it has none)
fn extract_text(document: &Html) -> String {
    let body = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next());
    let root = body.unwrap_or_else(|| document.root_element());

    let mut words: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| NON_CONTENT_ELEMENTS.contains(&element.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

/// Resolves a link href to an absolute URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Invalid URLs
/// - Non-HTTP(S) URLs after resolution
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    matches!(absolute_url.scheme(), "http" | "https").then(|| absolute_url.to_string())
}

/// `<loc>` entries of a sitemap document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitemapEntries {
    /// Page URLs from `<urlset>`
    pub urls: Vec<String>,
    /// Child sitemaps from `<sitemapindex>`
    pub sitemaps: Vec<String>,
}

/// Extracts page and child-sitemap locations from sitemap XML
pub fn parse_sitemap(xml: &str) -> SitemapEntries {
    let document = Html::parse_document(xml);
    let collect = |selector: &str| -> Vec<String> {
        Selector::parse(selector)
            .map(|selector| {
                document
                    .select(&selector)
                    .map(|loc| loc.text().collect::<String>().trim().to_string())
                    .filter(|loc| !loc.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };

    SitemapEntries {
        urls: collect("url > loc"),
        sitemaps: collect("sitemap > loc"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_url() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[test]
    fn test_extract_title_with_whitespace() {
        let html = r#"<html><head><title>  Test Page  </title></head><body></body></html>"#;
        assert_eq!(parse_html(html, &base_url()).title, Some("Test Page".to_string()));
    }

    #[test]
    fn test_no_title() {
        let html = r#"<html><head></head><body></body></html>"#;
        assert_eq!(parse_html(html, &base_url()).title, None);
    }

    #[test]
    fn test_relative_links_resolve_against_base() {
        let html = r#"<body><a href="/other">A</a><a href="sibling">B</a></body>"#;
        assert_eq!(
            parse_html(html, &base_url()).links,
            vec!["https://example.com/other", "https://example.com/sibling"]
        );
    }

    #[test]
    fn test_skipped_links() {
        let html = r##"
            <body>
                <a href="javascript:void(0)">js</a>
                <a href="mailto:test@example.com">mail</a>
                <a href="tel:+1234567890">tel</a>
                <a href="data:text/html,hi">data</a>
                <a href="/file.pdf" download>dl</a>
                <a href="#section">jump</a>
                <a href="ftp://example.com/file">ftp</a>
                <a href="/kept" rel="nofollow">kept</a>
            </body>
        "##;
        assert_eq!(
            parse_html(html, &base_url()).links,
            vec!["https://example.com/kept"]
        );
    }

    #[test]
    fn test_extract_canonical_link() {
        let html = r#"<html><head><link rel="canonical" href="https://example.com/canonical" /></head><body></body></html>"#;
        assert!(parse_html(html, &base_url())
            .links
            .contains(&"https://example.com/canonical".to_string()));
    }

    #[test]
    fn test_text_skips_scripts_and_styles() {
        let html = r#"
            <html><head><title>T</title><style>p { color: red }</style></head>
            <body>
                <h1>Hello</h1>
                <script>var x = 1;</script>
                <p>big   wide
                   world</p>
                <noscript>enable js</noscript>
            </body></html>
        "#;
        assert_eq!(parse_html(html, &base_url()).text, "Hello big wide world");
    }

    #[test]
    fn test_parse_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
                <url><loc>https://example.com/a</loc><lastmod>2024-01-01</lastmod></url>
                <url><loc> https://example.com/b </loc></url>
            </urlset>"#;
        let entries = parse_sitemap(xml);
        assert_eq!(entries.urls, vec!["https://example.com/a", "https://example.com/b"]);
        assert!(entries.sitemaps.is_empty());
    }

    #[test]
    fn test_parse_sitemap_index() {
        let xml = r#"<sitemapindex>
                <sitemap><loc>https://example.com/s1.xml</loc></sitemap>
                <sitemap><loc>https://example.com/s2.xml</loc></sitemap>
            </sitemapindex>"#;
        let entries = parse_sitemap(xml);
        assert_eq!(
            entries.sitemaps,
            vec!["https://example.com/s1.xml", "https://example.com/s2.xml"]
        );
        assert!(entries.urls.is_empty());
    }
}
