//! Crawler module for web page fetching and parsing
//!
//! This module contains the network-facing side of scraping:
//! - HTTP fetching with failure classification
//! - HTML parsing, link and text extraction
//! - Sitemap `<loc>` extraction

mod fetcher;
mod parser;

pub use fetcher::{build_http_client, fetch_text, fetch_url, user_agent_string, FetchResult};
pub use parser::{parse_html, parse_sitemap, ParsedPage, SitemapEntries};
