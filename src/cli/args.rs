use crate::config::parse::{parse_config_file, validate_config, ConfigError};
use crate::config::types::{Config, FailurePolicy, GapPolicy, StartAt, StatusConfig};
use crate::config::{expand_tilde, resolve_config_path};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line flags. Every setting is optional here; flags override the
/// config file, which overrides built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "tail-forward")]
#[command(
    about = "Forward an append-only log to a sink, resuming from a durable cursor",
    long_about = None
)]
pub struct Args {
    /// YAML config file (defaults to ~/.config/tail-forward/config.yml or /etc/tail-forward/config.yml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log to read: file://<path> or a bare path
    #[arg(long)]
    pub source: Option<String>,

    /// Destination: http(s)://, file:// or unix:// URI
    #[arg(long)]
    pub sink: Option<String>,

    /// Where the last forwarded position is kept
    #[arg(long)]
    pub cursor_file: Option<PathBuf>,

    #[arg(long)]
    pub max_batch_entries: Option<usize>,

    #[arg(long)]
    pub max_batch_bytes: Option<usize>,

    #[arg(long)]
    pub max_linger_ms: Option<u64>,

    /// Closed batches allowed to await acknowledgement
    #[arg(long)]
    pub max_outstanding: Option<usize>,

    /// Retries per batch after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Concurrent deliveries; above 1 the sink may see batches out of order
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    #[arg(long)]
    pub attempt_timeout_ms: Option<u64>,

    /// What to do with a batch whose retries are exhausted
    #[arg(long, value_enum)]
    pub on_failure: Option<FailurePolicy>,

    /// What to do when the source skipped ahead
    #[arg(long, value_enum)]
    pub on_gap: Option<GapPolicy>,

    /// Serve /health and /status on this address
    #[arg(long)]
    pub status_listen: Option<String>,

    /// Where to begin when no cursor has been saved
    #[arg(long, value_enum)]
    pub start_at: Option<StartAt>,
}

impl Args {
    /// File settings (if any) with flags applied on top, validated.
    pub fn build_config(&self) -> Result<Config, ConfigError> {
        let mut config = match resolve_config_path(self.config.as_deref()) {
            Some(path) => {
                tracing::info!(config_path = %path.display(), "Loading configuration");
                parse_config_file(&path)?
            }
            None => Config::default(),
        };

        self.apply_to(&mut config);
        validate_config(&config)?;
        Ok(config)
    }

    pub fn apply_to(&self, config: &mut Config) {
        if let Some(source) = &self.source {
            config.source.uri = source.clone();
        }
        if let Some(sink) = &self.sink {
            config.sink.uri = sink.clone();
        }
        if let Some(path) = &self.cursor_file {
            config.cursor.path = expand_tilde(path);
        }
        if let Some(n) = self.max_batch_entries {
            config.batch.max_entries = n;
        }
        if let Some(n) = self.max_batch_bytes {
            config.batch.max_bytes = n;
        }
        if let Some(ms) = self.max_linger_ms {
            config.batch.max_linger = Duration::from_millis(ms);
        }
        if let Some(k) = self.max_outstanding {
            config.delivery.max_outstanding = k;
        }
        if let Some(n) = self.max_retries {
            config.delivery.max_retries = n;
        }
        if let Some(n) = self.max_in_flight {
            config.delivery.max_in_flight = n;
        }
        if let Some(ms) = self.attempt_timeout_ms {
            config.sink.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = self.on_failure {
            config.delivery.on_failure = policy;
        }
        if let Some(policy) = self.on_gap {
            config.source.on_gap = policy;
        }
        if let Some(listen) = &self.status_listen {
            config.status = Some(StatusConfig {
                listen: listen.clone(),
            });
        }
        if let Some(start_at) = self.start_at {
            config.source.start_at = start_at;
        }
    }
}
