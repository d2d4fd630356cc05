use crate::config::types::{
    Config, FairnessConfig, PipelineConfig, RobotsConfig, SourceEntry,
    UserAgentConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pipeline_config(&config.pipeline)?;
    validate_fairness_config(&config.fairness)?;
    validate_robots_config(&config.robots)?;
    validate_user_agent_config(&config.user_agent)?;

    if config.output.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.embedding.dimensions == 0 {
        return Err(ConfigError::Validation(
            "embedding dimensions must be >= 1".to_string(),
        ));
    }

    validate_sources(&config.sources)?;
    Ok(())
}

fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.worker_count < 1 || config.worker_count > 256 {
        return Err(ConfigError::Validation(format!(
            "worker_count must be between 1 and 256, got {}",
            config.worker_count
        )));
    }

    if config.enqueue_batch_size < 1 {
        return Err(ConfigError::Validation(
            "enqueue_batch_size must be >= 1".to_string(),
        ));
    }

    if config.embed_batch_size < 1 {
        return Err(ConfigError::Validation(
            "embed_batch_size must be >= 1".to_string(),
        ));
    }

    if config.max_job_attempts < 1 {
        return Err(ConfigError::Validation(
            "max_job_attempts must be >= 1".to_string(),
        ));
    }

    if config.chunk_size < 1 || config.chunk_overlap >= config.chunk_size {
        return Err(ConfigError::Validation(format!(
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            config.chunk_overlap, config.chunk_size
        )));
    }

    Ok(())
}

fn validate_fairness_config(config: &FairnessConfig) -> Result<(), ConfigError> {
    if config.total_slots < 1 {
        return Err(ConfigError::Validation(format!(
            "total_slots must be >= 1, got {}",
            config.total_slots
        )));
    }

    if config.min_slots_per_run < 1 {
        return Err(ConfigError::Validation(
            "min_slots_per_run must be >= 1".to_string(),
        ));
    }

    if config.min_slots_per_run > config.max_slots_per_run {
        return Err(ConfigError::Validation(format!(
            "min_slots_per_run ({}) cannot exceed max_slots_per_run ({})",
            config.min_slots_per_run, config.max_slots_per_run
        )));
    }

    if config.max_slots_per_run > config.total_slots {
        return Err(ConfigError::Validation(format!(
            "max_slots_per_run ({}) cannot exceed total_slots ({})",
            config.max_slots_per_run, config.total_slots
        )));
    }

    if config.slot_ttl_seconds < 1 {
        return Err(ConfigError::Validation(
            "slot_ttl_seconds must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_robots_config(config: &RobotsConfig) -> Result<(), ConfigError> {
    if config.fetch_timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "robots fetch_timeout_ms must be >= 100ms, got {}ms",
            config.fetch_timeout_ms
        )));
    }
    Ok(())
}

/// The crawler name doubles as the robots.txt product token, so it is kept
/// to token characters
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    let name = &config.crawler_name;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || "-_".contains(c)) {
        return Err(ConfigError::Validation(format!(
            "crawler_name must be a non-empty token of [A-Za-z0-9_-], got '{}'",
            name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("contact_url: {}", e)))?;
    validate_email(&config.contact_email)
}

fn validate_sources(sources: &[SourceEntry]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();

    for source in sources {
        if source.name.is_empty() {
            return Err(ConfigError::Validation(
                "source name cannot be empty".to_string(),
            ));
        }

        if !names.insert(source.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate source name '{}'",
                source.name
            )));
        }

        if source.max_urls < 1 {
            return Err(ConfigError::Validation(format!(
                "source '{}' max_urls must be >= 1",
                source.name
            )));
        }

        if source.urls.is_empty() {
            return Err(ConfigError::Validation(format!(
                "source '{}' must list at least one URL",
                source.name
            )));
        }

        for raw in &source.urls {
            let url = Url::parse(raw).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid URL '{}' in '{}': {}", raw, source.name, e))
            })?;

            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::Validation(format!(
                    "URL '{}' must use http or https",
                    raw
                )));
            }
        }

        for pattern in &source.allowed_domains {
            validate_domain_pattern(pattern)?;
        }
    }

    Ok(())
}

/// Accepts `example.com` and `*.example.com`
fn validate_domain_pattern(pattern: &str) -> Result<(), ConfigError> {
    let host = pattern.strip_prefix("*.").unwrap_or(pattern);
    let labels_ok = !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if labels_ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidPattern(format!(
            "'{}' is not a domain or *.domain pattern",
            pattern
        )))
    }
}

fn validate_email(email: &str) -> Result<(), ConfigError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "contact_email '{}' is not an email address",
            email
        )))
    }
}
