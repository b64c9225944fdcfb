use super::file::FileSink;
use super::http::HttpSink;
use crate::config::types::SinkConfig;
use crate::pipeline::batch::Batch;
use crate::source::entry::{Cursor, Entry};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sink returned status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid sink URI: {0}")]
    InvalidUri(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// What the sink said about one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub message: Option<String>,
}

impl SinkResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            message: None,
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Destination for batches.
///
/// `send` is one attempt; retries, timeouts and the success rule (any
/// 2xx status) belong to the forwarder.
#[async_trait]
pub trait Sink: Send + Sync {
    fn describe(&self) -> String;

    async fn send(&self, batch: &Batch) -> Result<SinkResponse>;
}

/// Wire form of a batch. Identical on every attempt so the receiver can
/// deduplicate on `batch_id` or the cursor range.
#[derive(Debug, Serialize)]
pub struct BatchEnvelope<'a> {
    pub batch_id: Uuid,
    pub sequence: u64,
    pub host: &'a str,
    pub first_cursor: Cursor,
    pub last_cursor: Cursor,
    pub entries: &'a [Entry],
}

impl<'a> BatchEnvelope<'a> {
    pub fn new(batch: &'a Batch, host: &'a str) -> Self {
        Self {
            batch_id: batch.batch_id,
            sequence: batch.sequence,
            host,
            first_cursor: batch.first_cursor,
            last_cursor: batch.batch_cursor,
            entries: &batch.entries,
        }
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// One JSON document per entry, each terminated by a newline.
pub fn encode_ndjson(entries: &[Entry]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Build the sink named by `config.uri`, chosen by scheme.
pub fn sink_from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    let uri = config.uri.trim();
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Arc::new(HttpSink::new(uri, config.attempt_timeout, &config.headers)?));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Arc::new(FileSink::open(path)?));
    }
    #[cfg(unix)]
    if let Some(path) = uri.strip_prefix("unix://") {
        return Ok(Arc::new(super::unix::UnixSink::new(path)));
    }
    Err(SinkError::InvalidUri(config.uri.clone()))
}
