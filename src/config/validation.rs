use crate::config::types::{AmqpConfig, Config, CrawlerConfig, IndexConfig};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_url("extractor url", &config.extractor.url, &["http", "https"])?;
    validate_timeout("extractor timeout", config.extractor.timeout)?;
    validate_url("ipfs api-url", &config.ipfs.api_url, &["http", "https"])?;
    validate_timeout("ipfs timeout", config.ipfs.timeout)?;
    validate_amqp_config(&config.amqp)?;
    validate_index_config(&config.index)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.partial_size == 0 {
        return Err(ConfigError::Validation(
            "partial-size must be greater than 0".to_string(),
        ));
    }

    if config.metadata_max_size == 0 {
        return Err(ConfigError::Validation(
            "metadata-max-size must be greater than 0".to_string(),
        ));
    }

    if config.retry_wait < 10 {
        return Err(ConfigError::Validation(format!(
            "retry-wait must be >= 10ms, got {}ms",
            config.retry_wait
        )));
    }

    for (name, count) in [
        ("file-workers", config.file_workers),
        ("directory-workers", config.directory_workers),
    ] {
        if !(1..=100).contains(&count) {
            return Err(ConfigError::Validation(format!(
                "{} must be between 1 and 100, got {}",
                name, count
            )));
        }
    }

    Ok(())
}

/// Validates broker configuration
fn validate_amqp_config(config: &AmqpConfig) -> Result<(), ConfigError> {
    validate_url("amqp url", &config.url, &["amqp", "amqps"])?;

    if config.max_reconnect < 1 {
        return Err(ConfigError::Validation(format!(
            "max-reconnect must be >= 1, got {}",
            config.max_reconnect
        )));
    }

    if config.file_queue.trim().is_empty() || config.directory_queue.trim().is_empty() {
        return Err(ConfigError::Validation(
            "queue names cannot be empty".to_string(),
        ));
    }

    if config.file_queue == config.directory_queue {
        return Err(ConfigError::Validation(format!(
            "file-queue and directory-queue must differ, both are '{}'",
            config.file_queue
        )));
    }

    Ok(())
}

/// Validates index configuration
fn validate_index_config(config: &IndexConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_timeout(name: &str, timeout: u64) -> Result<(), ConfigError> {
    if timeout == 0 {
        return Err(ConfigError::Validation(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(())
}

/// Validates that a URL parses and uses one of the allowed schemes
fn validate_url(name: &str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", name, value, e)))?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl(format!(
            "{} '{}' must use one of: {}",
            name,
            value,
            schemes.join(", ")
        )));
    }

    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl(format!(
            "{} '{}' cannot be used as a base URL",
            name, value
        )));
    }

    Ok(())
}
