//! HTTP fetcher implementation
//!
//! This module handles the HTTP side of scraping:
//! - Building HTTP clients with proper user agent strings
//! - GET requests for pages and sitemaps
//! - Error classification into transient and permanent failures

use crate::config::UserAgentConfig;
use crate::{IngestError, Result};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;

/// Result of a fetch operation
#[derive(Debug)]
pub enum FetchResult {
    /// Successfully fetched the page
    Success {
        /// Final URL after redirects
        final_url: String,
        /// HTTP status code
        status_code: u16,
        /// Content-Type header value
        content_type: String,
        /// Page body content
        body: String,
    },

    /// Page is not HTML (Content-Type mismatch)
    ContentMismatch {
        /// The actual Content-Type received
        content_type: String,
    },

    /// Non-success HTTP status
    HttpError {
        /// The HTTP status code
        status_code: u16,
    },

    /// Network error (connection refused, timeout, etc.)
    NetworkError {
        /// Error description
        error: String,
        /// Timeouts and connection failures may succeed on retry
        transient: bool,
    },
}

impl FetchResult {
    /// Whether retrying the same request later could succeed
    ///
    /// | Condition | Transient |
    /// |-----------|-----------|
    /// | HTTP 429 | yes |
    /// | HTTP 5xx | yes |
    /// | Timeout / connect error | yes |
    /// | Other HTTP errors | no |
    /// | Non-HTML content | no |
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Success { .. } | Self::ContentMismatch { .. } => false,
            Self::HttpError { status_code } => {
                *status_code == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status_code >= 500
            }
            Self::NetworkError { transient, .. } => *transient,
        }
    }

    /// Human readable failure description; `None` on success
    pub fn failure(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::ContentMismatch { content_type } => {
                Some(format!("unsupported content type {content_type}"))
            }
            Self::HttpError { status_code } => Some(format!("HTTP {status_code}")),
            Self::NetworkError { error, .. } => Some(error.clone()),
        }
    }
}

/// Formats `CrawlerName/Version (+ContactURL; ContactEmail)`
pub fn user_agent_string(config: &UserAgentConfig) -> String {
    format!(
        "{}/{} (+{}; {})",
        config.crawler_name, config.crawler_version, config.contact_url, config.contact_email
    )
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use crawl_ingest::config::UserAgentConfig;
/// use crawl_ingest::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "IngestBot".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> std::result::Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent_string(config))
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

fn is_html(content_type: &str) -> bool {
    // A missing header is given the benefit of the doubt
    content_type.is_empty()
        || content_type.contains("text/html")
        || content_type.contains("application/xhtml+xml")
}

/// Fetches an HTML page
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - The URL to fetch
///
/// # Returns
///
/// A FetchResult indicating success or the type of failure
pub async fn fetch_url(client: &Client, url: &str) -> FetchResult {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            return FetchResult::NetworkError {
                error: if e.is_timeout() {
                    "Request timeout".to_string()
                } else {
                    e.to_string()
                },
                transient: e.is_timeout() || e.is_connect(),
            }
        }
    };

    let status = response.status();
    let final_url = response.url().to_string();

    if !status.is_success() {
        return FetchResult::HttpError {
            status_code: status.as_u16(),
        };
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !is_html(&content_type) {
        return FetchResult::ContentMismatch { content_type };
    }

    match response.text().await {
        Ok(body) => FetchResult::Success {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body,
        },
        Err(e) => FetchResult::NetworkError {
            error: e.to_string(),
            transient: true,
        },
    }
}

/// Fetches a document body of any content type, e.g. a sitemap
pub async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(IngestError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> UserAgentConfig {
        UserAgentConfig {
            crawler_name: "TestCrawler".to_string(),
            crawler_version: "1.0".to_string(),
            contact_url: "https://example.com/about".to_string(),
            contact_email: "admin@example.com".to_string(),
        }
    }

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client(&create_test_config()).is_ok());
    }

    #[test]
    fn test_user_agent_format() {
        assert_eq!(
            user_agent_string(&create_test_config()),
            "TestCrawler/1.0 (+https://example.com/about; admin@example.com)"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchResult::HttpError { status_code: 503 }.is_transient());
        assert!(FetchResult::HttpError { status_code: 429 }.is_transient());
        assert!(!FetchResult::HttpError { status_code: 404 }.is_transient());
        assert!(!FetchResult::ContentMismatch {
            content_type: "application/pdf".into()
        }
        .is_transient());
        assert_eq!(
            FetchResult::HttpError { status_code: 404 }.failure().as_deref(),
            Some("HTTP 404")
        );
    }

    #[test]
    fn test_html_content_types() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("application/xhtml+xml"));
        assert!(is_html(""));
        assert!(!is_html("application/pdf"));
    }
}
