use super::backpressure::OutstandingLimiter;
use super::batch::Batch;
use crate::config::types::BatchConfig;
use crate::source::entry::Entry;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("channel send error")]
    ChannelSend,

    #[error("outstanding batch limiter closed")]
    LimiterClosed,

    #[error("delivery task failed: {0}")]
    DeliveryTask(String),
}

/// A closed batch together with its outstanding-batch permit.
///
/// Dropping the permit frees a slot for the batcher, so it must stay with
/// the batch until the committer is done with it.
#[derive(Debug)]
pub struct PendingBatch {
    pub batch: Batch,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub max_linger: Duration,
}

impl BatchLimits {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            max_bytes: config.max_bytes.max(1),
            max_linger: config.max_linger,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

/// Accumulates entries into batches closed by count, size or age.
#[derive(Debug)]
pub struct Batcher {
    limits: BatchLimits,
    entries: Vec<Entry>,
    bytes: usize,
    opened_at: Option<Instant>,
    next_sequence: u64,
}

impl Batcher {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            entries: Vec::new(),
            bytes: 0,
            opened_at: None,
            next_sequence: 0,
        }
    }

    /// Add an entry; returns the batch it closed, if any.
    ///
    /// The byte limit is checked after adding, so an entry larger than
    /// `max_bytes` ends up alone in its own batch.
    pub fn push(&mut self, entry: Entry) -> Option<Batch> {
        if self.entries.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += entry.raw_size;
        self.entries.push(entry);

        if self.entries.len() >= self.limits.max_entries || self.bytes >= self.limits.max_bytes {
            self.flush()
        } else {
            None
        }
    }

    /// Close whatever is open, even if no limit was reached.
    pub fn flush(&mut self) -> Option<Batch> {
        let entries = std::mem::take(&mut self.entries);
        self.bytes = 0;
        self.opened_at = None;

        let batch = Batch::new(self.next_sequence, entries)?;
        self.next_sequence += 1;
        Some(batch)
    }

    /// When the open batch must be closed regardless of its size
    pub fn linger_deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.limits.max_linger)
    }

    pub fn open_entries(&self) -> usize {
        self.entries.len()
    }
}

/// Run the batcher task.
///
/// Receives entries from the reader, closes batches by count, size or
/// linger, and hands each one downstream once an outstanding-batch permit
/// is available. When the input closes the open batch is flushed.
pub async fn run_batcher(
    mut input: mpsc::Receiver<Entry>,
    output: mpsc::Sender<PendingBatch>,
    mut batcher: Batcher,
    limiter: OutstandingLimiter,
) -> Result<(), PipelineError> {
    info!("Batcher started");

    loop {
        let deadline = batcher.linger_deadline();
        let linger = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = input.recv() => {
                match result {
                    Some(entry) => {
                        if let Some(batch) = batcher.push(entry) {
                            emit(batch, &output, &limiter).await?;
                        }
                    }
                    None => {
                        info!("Input channel closed, flushing open batch");
                        break;
                    }
                }
            }
            _ = linger => {
                if let Some(batch) = batcher.flush() {
                    debug!(sequence = batch.sequence, "Linger elapsed, closing batch");
                    emit(batch, &output, &limiter).await?;
                }
            }
        }
    }

    if let Some(batch) = batcher.flush() {
        emit(batch, &output, &limiter).await?;
    }

    info!("Batcher stopped");
    Ok(())
}

async fn emit(
    batch: Batch,
    output: &mpsc::Sender<PendingBatch>,
    limiter: &OutstandingLimiter,
) -> Result<(), PipelineError> {
    debug!(
        sequence = batch.sequence,
        entries = batch.len(),
        bytes = batch.raw_bytes,
        first = %batch.first_cursor,
        last = %batch.batch_cursor,
        outstanding = limiter.outstanding(),
        "Closed batch"
    );

    let permit = limiter.acquire().await.ok_or(PipelineError::LimiterClosed)?;
    output
        .send(PendingBatch { batch, permit })
        .await
        .map_err(|_| PipelineError::ChannelSend)
}
