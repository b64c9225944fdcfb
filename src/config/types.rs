use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub cursor: CursorConfig,
    pub batch: BatchConfig,
    pub delivery: DeliveryConfig,
    pub status: Option<StatusConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub uri: String,
    /// Where to begin when no cursor has been saved yet
    pub start_at: StartAt,
    pub timestamp: Option<TimestampConfig>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub on_gap: GapPolicy,
    /// Retries for an unavailable source before the engine faults
    pub max_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            start_at: StartAt::Beginning,
            timestamp: None,
            poll_interval: Duration::from_millis(250),
            on_gap: GapPolicy::Skip,
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartAt {
    Beginning,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Log the gap and continue from where the source resumed
    Skip,
    /// Fault the engine
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    pub pattern: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub uri: String,
    /// Upper bound for a single delivery attempt
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Extra request headers for http sinks
    pub headers: HashMap<String, String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            attempt_timeout: Duration::from_secs(10),
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub max_linger: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 1024 * 1024,
            max_linger: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Closed batches allowed to wait for acknowledgement at once
    pub max_outstanding: usize,
    /// Deliveries running concurrently; 1 keeps sink order equal to source order
    pub max_in_flight: usize,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub on_failure: FailurePolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 4,
            max_in_flight: 1,
            max_retries: 5,
            backoff: BackoffConfig::default(),
            on_failure: FailurePolicy::Halt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
    /// Fraction of the delay added at random, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop and fault, leaving the cursor before the failed batch
    Halt,
    /// Skip the failed batch and advance the cursor past it
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub listen: String,
}
