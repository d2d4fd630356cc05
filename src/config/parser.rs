//! Reading configuration files

use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and validates the configuration at `path`
///
/// # Errors
///
/// `ConfigError::Io` if the file cannot be read, `ConfigError::Parse` for
/// malformed TOML, and `Validation`/`InvalidUrl`/`InvalidPattern` when a value
/// is out of range.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    load_config_with_hash(path).map(|(config, _)| config)
}

/// Parses and validates configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Hex SHA-256 of the configuration file's bytes
///
/// Runs record this fingerprint so a changed configuration is visible when
/// comparing runs of the same source.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    Ok(hash_content(&std::fs::read_to_string(path)?))
}

/// Loads a configuration together with the hash of the exact text parsed
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok((config, hash_content(&content)))
}

fn hash_content(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceMode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const MINIMAL: &str = r#"
[user-agent]
crawler-name = "IngestBot"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[output]
database-path = "./ingest.db"
"#;

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let file = create_temp_config(MINIMAL);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.user_agent.crawler_name, "IngestBot");
        assert_eq!(config.pipeline.worker_count, 8);
        assert_eq!(config.fairness.total_slots, 20);
        assert!(config.robots.enabled);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let content = format!(
            r#"{MINIMAL}
[pipeline]
worker-count = 4
embed-batch-size = 16

[fairness]
total-slots = 10
min-slots-per-run = 1
max-slots-per-run = 4

[robots]
enabled = false

[[source]]
name = "docs"
mode = "domain"
urls = ["https://docs.example.com/"]
max-urls = 50
allowed-domains = ["*.example.com"]

[[source]]
name = "handbook"
tenant = "acme"
mode = "list"
urls = ["https://example.com/a", "https://example.com/b"]
respect-robots-txt = false
"#
        );
        let file = create_temp_config(&content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.pipeline.worker_count, 4);
        assert_eq!(config.pipeline.embed_batch_size, 16);
        assert_eq!(config.pipeline.chunk_size, 1200);
        assert_eq!(config.fairness.max_slots_per_run, 4);
        assert!(!config.robots.enabled);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].mode, SourceMode::Domain);
        assert_eq!(config.sources[0].tenant, "default");
        assert!(config.sources[0].respect_robots_txt);
        assert_eq!(config.sources[1].tenant, "acme");
        assert!(!config.sources[1].respect_robots_txt);
        assert_eq!(config.sources[1].max_urls, 500);
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/ingest.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let content = format!("{MINIMAL}\n[fairness]\ntotal-slots = 0\n");
        let file = create_temp_config(&content);
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_hash_matches_loaded_content() {
        let file = create_temp_config(MINIMAL);

        let (_, loaded) = load_config_with_hash(file.path()).unwrap();
        let computed = compute_config_hash(file.path()).unwrap();

        assert_eq!(loaded, computed);
        assert_eq!(loaded.len(), 64);
    }

    #[test]
    fn test_different_content_different_hash() {
        let file1 = create_temp_config("content 1");
        let file2 = create_temp_config("content 2");

        assert_ne!(
            compute_config_hash(file1.path()).unwrap(),
            compute_config_hash(file2.path()).unwrap()
        );
    }
}
