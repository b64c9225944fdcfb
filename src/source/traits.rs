use super::entry::{Cursor, Entry};
use super::timestamp::TimestampError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("invalid source uri: {0}")]
    InvalidUri(String),
}

impl SourceError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Unavailable(_) => true,
            SourceError::Io(e) => e.kind() != std::io::ErrorKind::InvalidData,
            SourceError::Timestamp(_) | SourceError::InvalidUri(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    /// The stream was replaced by a new one before it was fully read
    Rotated,
    /// The stream shrank below the resume position
    Truncated,
    /// Entries at the resume position were removed by retention
    Vacuumed,
    /// The resume position lies beyond anything the source holds
    CursorNotFound,
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GapReason::Rotated => "rotated",
            GapReason::Truncated => "truncated",
            GapReason::Vacuumed => "vacuumed",
            GapReason::CursorNotFound => "cursor not found",
        };
        f.write_str(s)
    }
}

/// Discontinuity in the source: entries between `expected` and `resumed_at`
/// can no longer be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub reason: GapReason,
    /// Position the reader wanted to continue from
    pub expected: Option<Cursor>,
    /// Position the source continues from instead
    pub resumed_at: Option<Cursor>,
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |c: &Option<Cursor>| c.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{} (expected {}, resumed at {})",
            self.reason,
            show(&self.expected),
            show(&self.resumed_at)
        )
    }
}

#[derive(Debug)]
pub enum SeekOutcome {
    Exact,
    Gap(Gap),
}

#[derive(Debug)]
pub enum SourcePoll {
    Entry(Entry),
    /// Nothing new right now; call `wait_for_data` before polling again
    Pending,
    Gap(Gap),
}

/// An append-only log that can be positioned by cursor and followed.
#[async_trait]
pub trait LogSource: Send {
    /// Human readable name for logs
    fn describe(&self) -> String;

    /// Position the source just after `cursor`, or at the oldest available
    /// entry when `cursor` is `None`.
    async fn seek(&mut self, cursor: Option<&Cursor>) -> Result<SeekOutcome>;

    async fn next_entry(&mut self) -> Result<SourcePoll>;

    /// Cursor of the newest entry currently in the source, `None` when empty
    async fn tail_cursor(&mut self) -> Result<Option<Cursor>>;

    /// Block until new data may be available or `timeout` passes
    async fn wait_for_data(&mut self, timeout: Duration) -> Result<()>;
}
