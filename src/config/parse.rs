use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::source::file::parse_source_uri;
use crate::source::timestamp::TimestampExtractor;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Load, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = parse_config_file(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load and expand a config file without validating it, so command-line
/// flags can still fill in missing settings.
pub fn parse_config_file(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config_str(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    Ok(config)
}

/// Every `$env{...}` left after expansion names an unset variable.
fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let missing = unexpanded_env_vars(yaml);
    if missing.is_empty() {
        return Ok(());
    }

    let noun = if missing.len() == 1 { "variable" } else { "variables" };
    Err(ConfigError::Validation(format!(
        "environment {} not set: {}\n\
         export them before starting, or put literal values in the config file",
        noun,
        missing.join(", ")
    )))
}

/// Expands tilde (~) in every path-like setting.
pub fn expand_paths(config: &mut Config) {
    config.cursor.path = expand_tilde(&config.cursor.path);
    config.source.uri = expand_uri_tilde(&config.source.uri, "file://");
    config.sink.uri = expand_uri_tilde(&config.sink.uri, "file://");
    config.sink.uri = expand_uri_tilde(&config.sink.uri, "unix://");
}

fn expand_uri_tilde(uri: &str, scheme: &str) -> String {
    match uri.strip_prefix(scheme) {
        Some(path) if path.starts_with('~') => {
            format!("{}{}", scheme, expand_tilde(Path::new(path)).display())
        }
        None if uri.starts_with('~') => expand_tilde(Path::new(uri)).display().to_string(),
        _ => uri.to_string(),
    }
}

/// Check every setting, reporting all problems at once.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_source(&config.source, &mut errors);
    validate_sink(&config.sink, &mut errors);

    if config.cursor.path.as_os_str().is_empty() {
        errors.push("cursor.path is required (--cursor-file)".to_string());
    }

    validate_batch(&config.batch, &mut errors);
    validate_delivery(&config.delivery, &mut errors);

    if let Some(status) = &config.status {
        if status.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "status.listen: expected host:port socket address, got '{}'",
                status.listen
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    if source.uri.trim().is_empty() {
        errors.push("source.uri is required (--source)".to_string());
    } else if let Err(e) = parse_source_uri(&source.uri) {
        errors.push(format!("source.uri: {}", e));
    }

    if source.poll_interval.is_zero() {
        errors.push("source.poll_interval must be greater than zero".to_string());
    }

    if let Some(timestamp) = &source.timestamp {
        if let Err(e) = TimestampExtractor::new(&timestamp.pattern, &timestamp.format) {
            errors.push(format!("source.timestamp: {}", e));
        }
    }
}

fn validate_sink(sink: &SinkConfig, errors: &mut Vec<String>) {
    let uri = sink.uri.trim();
    if uri.is_empty() {
        errors.push("sink.uri is required (--sink)".to_string());
        return;
    }

    #[cfg(unix)]
    const SCHEMES: &[&str] = &["http://", "https://", "file://", "unix://"];
    #[cfg(not(unix))]
    const SCHEMES: &[&str] = &["http://", "https://", "file://"];

    match SCHEMES.iter().find(|scheme| uri.starts_with(**scheme)) {
        None => errors.push(format!(
            "sink.uri: unsupported scheme in '{}' (expected one of {})",
            uri,
            SCHEMES.join(", ")
        )),
        Some(scheme) if uri.len() == scheme.len() => {
            errors.push(format!("sink.uri: '{}' has no target", uri));
        }
        Some(_) => {}
    }

    if sink.attempt_timeout.is_zero() {
        errors.push("sink.attempt_timeout must be greater than zero".to_string());
    }
}

fn validate_batch(batch: &BatchConfig, errors: &mut Vec<String>) {
    if batch.max_entries == 0 {
        errors.push("batch.max_entries must be at least 1".to_string());
    }
    if batch.max_bytes == 0 {
        errors.push("batch.max_bytes must be at least 1".to_string());
    }
    if batch.max_linger.is_zero() {
        errors.push("batch.max_linger must be greater than zero".to_string());
    }
}

fn validate_delivery(delivery: &DeliveryConfig, errors: &mut Vec<String>) {
    if delivery.max_outstanding == 0 {
        errors.push("delivery.max_outstanding must be at least 1".to_string());
    }
    if delivery.max_in_flight == 0 {
        errors.push("delivery.max_in_flight must be at least 1".to_string());
    }

    let backoff = &delivery.backoff;
    if backoff.multiplier < 1.0 {
        errors.push(format!(
            "delivery.backoff.multiplier must be >= 1.0, got {}",
            backoff.multiplier
        ));
    }
    if !(0.0..=1.0).contains(&backoff.jitter) {
        errors.push(format!(
            "delivery.backoff.jitter must be between 0.0 and 1.0, got {}",
            backoff.jitter
        ));
    }
    if backoff.base > backoff.cap {
        errors.push(format!(
            "delivery.backoff.base ({:?}) exceeds delivery.backoff.cap ({:?})",
            backoff.base, backoff.cap
        ));
    }
}
