use super::entry::{Cursor, Entry};
use super::traits::{Gap, LogSource, SeekOutcome, SourceError, SourcePoll};
use crate::backoff::Backoff;
use crate::config::types::{BackoffConfig, SourceConfig, StartAt};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("source unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("reader cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub start_at: StartAt,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl ReaderSettings {
    pub fn from_config(source: &SourceConfig, backoff: &BackoffConfig) -> Self {
        Self {
            start_at: source.start_at,
            poll_interval: source.poll_interval,
            max_retries: source.max_retries,
            backoff: Backoff::from_config(backoff),
        }
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self::from_config(&SourceConfig::default(), &BackoffConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Backlog,
    Follow,
}

#[derive(Debug)]
pub enum ReadEvent {
    Entry(Entry),
    /// Emitted once, between the last backlog entry and the first followed one
    CaughtUp { boundary: Option<Cursor> },
    Gap(Gap),
}

/// Turns a [`LogSource`] into one continuous sequence: backlog replay up to
/// the tail observed at open time, then follow mode.
pub struct SourceReader {
    source: Box<dyn LogSource>,
    settings: ReaderSettings,
    cancel: CancellationToken,

    /// Tail of the source when the reader was opened. Never refreshed.
    boundary: Option<Cursor>,
    mode: ReadMode,
    last_cursor: Option<Cursor>,
    pending_gap: Option<Gap>,
}

impl SourceReader {
    /// Position the source after `start`, then snapshot the tail boundary.
    ///
    /// With no saved cursor and `StartAt::End`, the source is first opened
    /// at its beginning to find the tail, and reading starts there.
    pub async fn open(
        source: Box<dyn LogSource>,
        start: Option<Cursor>,
        settings: ReaderSettings,
        cancel: CancellationToken,
    ) -> Result<Self, ReaderError> {
        let mut reader = Self {
            source,
            settings,
            cancel,
            boundary: None,
            mode: ReadMode::Backlog,
            last_cursor: None,
            pending_gap: None,
        };

        let start = match (start, reader.settings.start_at) {
            (Some(cursor), _) => Some(cursor),
            (None, StartAt::Beginning) => None,
            (None, StartAt::End) => {
                reader.seek_source(None).await?;
                reader.snapshot_tail().await?
            }
        };

        match reader.seek_source(start.as_ref()).await? {
            SeekOutcome::Exact => reader.last_cursor = start,
            SeekOutcome::Gap(gap) => {
                reader.last_cursor = gap.resumed_at;
                reader.pending_gap = Some(gap);
            }
        }

        // Taken after the seek so it is in the same generation as the entries read next
        reader.boundary = reader.snapshot_tail().await?;

        info!(
            source = %reader.source.describe(),
            start = ?start.map(|c| c.to_string()),
            boundary = ?reader.boundary.map(|c| c.to_string()),
            "Opened source reader"
        );

        Ok(reader)
    }

    async fn seek_source(&mut self, start: Option<&Cursor>) -> Result<SeekOutcome, ReaderError> {
        let mut attempt = 0;
        loop {
            match self.source.seek(start).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => self.retry_pause("seek", &mut attempt, e).await?,
            }
        }
    }

    async fn snapshot_tail(&mut self) -> Result<Option<Cursor>, ReaderError> {
        let mut attempt = 0;
        loop {
            match self.source.tail_cursor().await {
                Ok(tail) => return Ok(tail),
                Err(e) => self.retry_pause("tail_cursor", &mut attempt, e).await?,
            }
        }
    }

    pub fn boundary(&self) -> Option<Cursor> {
        self.boundary
    }

    pub fn last_cursor(&self) -> Option<Cursor> {
        self.last_cursor
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    /// Next event, or `None` once the reader has been cancelled.
    pub async fn next_event(&mut self) -> Result<Option<ReadEvent>, ReaderError> {
        match self.poll_event().await {
            Ok(event) => Ok(Some(event)),
            Err(ReaderError::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn poll_event(&mut self) -> Result<ReadEvent, ReaderError> {
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReaderError::Cancelled);
            }
            if let Some(gap) = self.pending_gap.take() {
                return Ok(ReadEvent::Gap(gap));
            }
            if self.mode == ReadMode::Backlog && self.backlog_complete() {
                return Ok(self.enter_follow());
            }

            let poll = match self.source.next_entry().await {
                Ok(poll) => poll,
                Err(e) => {
                    self.retry_pause("next_entry", &mut attempt, e).await?;
                    continue;
                }
            };
            attempt = 0;

            match poll {
                SourcePoll::Entry(entry) => {
                    self.last_cursor = Some(entry.cursor);
                    return Ok(ReadEvent::Entry(entry));
                }
                SourcePoll::Gap(gap) => {
                    if let Some(resumed) = gap.resumed_at {
                        self.last_cursor = Some(resumed);
                    }
                    return Ok(ReadEvent::Gap(gap));
                }
                SourcePoll::Pending if self.mode == ReadMode::Backlog => {
                    // Source ran dry short of the boundary (e.g. trailing partial record)
                    debug!(
                        last = ?self.last_cursor.map(|c| c.to_string()),
                        "Source drained before reaching boundary"
                    );
                    return Ok(self.enter_follow());
                }
                SourcePoll::Pending => {
                    let poll_interval = self.settings.poll_interval;
                    let waited = tokio::select! {
                        _ = self.cancel.cancelled() => None,
                        result = self.source.wait_for_data(poll_interval) => Some(result),
                    };
                    match waited {
                        None => return Err(ReaderError::Cancelled),
                        Some(Ok(())) => {}
                        Some(Err(e)) => self.retry_pause("wait_for_data", &mut attempt, e).await?,
                    }
                }
            }
        }
    }

    fn backlog_complete(&self) -> bool {
        match (self.boundary, self.last_cursor) {
            (None, _) => true,
            (Some(boundary), Some(last)) => last >= boundary,
            (Some(_), None) => false,
        }
    }

    fn enter_follow(&mut self) -> ReadEvent {
        self.mode = ReadMode::Follow;
        info!(
            source = %self.source.describe(),
            boundary = ?self.boundary.map(|c| c.to_string()),
            "Backlog replay complete, following source"
        );
        ReadEvent::CaughtUp {
            boundary: self.boundary,
        }
    }

    /// Sleep before retrying a failed source call, or give up.
    async fn retry_pause(
        &mut self,
        op: &'static str,
        attempt: &mut u32,
        err: SourceError,
    ) -> Result<(), ReaderError> {
        if !err.is_transient() {
            return Err(ReaderError::Source(err));
        }

        *attempt += 1;
        if *attempt > self.settings.max_retries {
            error!(
                kind = "source_unavailable",
                op,
                attempts = *attempt,
                cursor = ?self.last_cursor.map(|c| c.to_string()),
                error = %err,
                "Source unavailable, giving up"
            );
            return Err(ReaderError::Unavailable {
                attempts: *attempt,
                source: err,
            });
        }

        let delay = self.settings.backoff.delay_for_retry(*attempt);
        warn!(
            op,
            attempt = *attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Source call failed, retrying"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReaderError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
