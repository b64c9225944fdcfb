use super::sink::{Sink, SinkError, SinkResponse};
use crate::backoff::Backoff;
use crate::config::types::{DeliveryConfig, SinkConfig};
use crate::pipeline::batch::{Batch, DeliveryState};
use crate::pipeline::batcher::{PendingBatch, PipelineError};
use crate::source::entry::Cursor;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    pub attempt_timeout: Duration,
    pub max_in_flight: usize,
}

impl DeliverySettings {
    pub fn from_config(delivery: &DeliveryConfig, sink: &SinkConfig) -> Self {
        Self {
            max_retries: delivery.max_retries,
            backoff: Backoff::from_config(&delivery.backoff),
            attempt_timeout: sink.attempt_timeout,
            max_in_flight: delivery.max_in_flight.max(1),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default(), &SinkConfig::default())
    }
}

/// Final result of delivering one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl DeliveryOutcome {
    /// Resolved without contacting the sink (engine halted). The batch never
    /// left `Pending`, so its entries were not delivered.
    fn skipped() -> Self {
        Self {
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn is_acked(&self) -> bool {
        self.state == DeliveryState::Acked
    }
}

/// Delivery result handed to the committer. Holds the batch's
/// outstanding permit until the committer drops it.
#[derive(Debug)]
pub struct Completion {
    pub sequence: u64,
    pub first_cursor: Cursor,
    pub last_cursor: Cursor,
    pub entry_count: usize,
    pub outcome: DeliveryOutcome,
    pub permit: OwnedSemaphorePermit,
}

/// Batches counted by their current delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub pending: usize,
    pub in_flight: usize,
}

type CountsListener = Arc<dyn Fn(DeliveryCounts) + Send + Sync>;

/// State of every batch the forwarder holds, keyed by sequence.
///
/// A batch enters as `Pending` when the forwarder takes it, is `InFlight`
/// while the sink is being called, and leaves once its result has been
/// handed to the committer.
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    states: Arc<Mutex<BTreeMap<u64, DeliveryState>>>,
    on_change: Option<CountsListener>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` with fresh counts after every change.
    pub fn on_change(mut self, listener: impl Fn(DeliveryCounts) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(listener));
        self
    }

    pub fn state(&self, sequence: u64) -> Option<DeliveryState> {
        self.lock().get(&sequence).copied()
    }

    pub fn counts(&self) -> DeliveryCounts {
        Self::count(&self.lock())
    }

    fn set(&self, sequence: u64, state: DeliveryState) {
        let counts = {
            let mut states = self.lock();
            states.insert(sequence, state);
            Self::count(&states)
        };
        self.notify(counts);
    }

    fn remove(&self, sequence: u64) {
        let counts = {
            let mut states = self.lock();
            states.remove(&sequence);
            Self::count(&states)
        };
        self.notify(counts);
    }

    fn notify(&self, counts: DeliveryCounts) {
        if let Some(listener) = &self.on_change {
            listener(counts);
        }
    }

    fn count(states: &BTreeMap<u64, DeliveryState>) -> DeliveryCounts {
        let mut counts = DeliveryCounts::default();
        for state in states.values() {
            match state {
                DeliveryState::Pending => counts.pending += 1,
                DeliveryState::InFlight => counts.in_flight += 1,
                DeliveryState::Acked | DeliveryState::Failed(_) => {}
            }
        }
        counts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, DeliveryState>> {
        // A panic while holding the lock cannot leave the map half-written
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("counts", &self.counts())
            .finish()
    }
}

/// Sends batches to a sink with per-attempt timeout and exponential backoff.
pub struct Forwarder {
    sink: Arc<dyn Sink>,
    settings: DeliverySettings,
    tracker: DeliveryTracker,
}

impl Forwarder {
    pub fn new(sink: Arc<dyn Sink>, settings: DeliverySettings) -> Self {
        Self {
            sink,
            settings,
            tracker: DeliveryTracker::new(),
        }
    }

    pub fn with_tracker(mut self, tracker: DeliveryTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Deliver `batch`, retrying up to `max_retries` times.
    pub async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let mut retries = 0;

        loop {
            let attempt = retries + 1;
            debug!(
                sequence = batch.sequence,
                attempt,
                first = %batch.first_cursor,
                last = %batch.batch_cursor,
                "Sending batch"
            );

            let err = match self.attempt(batch).await {
                Ok(response) => {
                    debug!(
                        sequence = batch.sequence,
                        attempt,
                        status = response.status,
                        "Batch acknowledged"
                    );
                    return DeliveryOutcome {
                        state: DeliveryState::Acked,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Err(e) => e,
            };

            if retries >= self.settings.max_retries {
                error!(
                    kind = "sink_failure",
                    sequence = batch.sequence,
                    attempts = attempt,
                    first = %batch.first_cursor,
                    last = %batch.batch_cursor,
                    sink = %self.sink.describe(),
                    error = %err,
                    "Delivery failed, retries exhausted"
                );
                return DeliveryOutcome {
                    state: DeliveryState::Failed(retries),
                    attempts: attempt,
                    last_error: Some(err.to_string()),
                };
            }

            retries += 1;
            let delay = self.settings.backoff.delay_for_retry(retries);
            warn!(
                sequence = batch.sequence,
                attempt,
                first = %batch.first_cursor,
                last = %batch.batch_cursor,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, batch: &Batch) -> Result<SinkResponse, SinkError> {
        let timeout = self.settings.attempt_timeout;
        match tokio::time::timeout(timeout, self.sink.send(batch)).await {
            Err(_) => Err(SinkError::Timeout(timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(SinkError::Rejected {
                status: response.status,
                message: response.message.unwrap_or_default(),
            }),
        }
    }
}

/// Run the forwarder task.
///
/// Takes closed batches from the batcher and delivers up to
/// `max_in_flight` of them concurrently, reporting each result to the
/// committer. Once `halted` fires, queued batches are resolved without
/// being sent; deliveries already running finish normally. Returns after
/// the input closes and every delivery has been reported.
pub async fn run_forwarder(
    mut input: mpsc::Receiver<PendingBatch>,
    output: mpsc::Sender<Completion>,
    forwarder: Arc<Forwarder>,
    halted: CancellationToken,
) -> Result<(), PipelineError> {
    let max_in_flight = forwarder.settings.max_in_flight;
    let mut in_flight: JoinSet<Completion> = JoinSet::new();

    info!(
        sink = %forwarder.sink.describe(),
        max_in_flight,
        "Forwarder started"
    );

    loop {
        tokio::select! {
            result = input.recv(), if in_flight.len() < max_in_flight => {
                match result {
                    Some(pending) => {
                        forwarder.tracker.set(pending.batch.sequence, DeliveryState::Pending);
                        let forwarder = forwarder.clone();
                        let halted = halted.clone();
                        in_flight.spawn(async move { dispatch(&forwarder, pending, &halted).await });
                    }
                    None => break,
                }
            }
            Some(joined) = in_flight.join_next() => {
                report(joined, &output, &forwarder.tracker).await?;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        report(joined, &output, &forwarder.tracker).await?;
    }

    info!("Forwarder stopped");
    Ok(())
}

async fn dispatch(
    forwarder: &Forwarder,
    pending: PendingBatch,
    halted: &CancellationToken,
) -> Completion {
    let PendingBatch { batch, permit } = pending;

    let outcome = if halted.is_cancelled() {
        debug!(sequence = batch.sequence, "Engine halted, not sending batch");
        DeliveryOutcome::skipped()
    } else {
        forwarder.tracker.set(batch.sequence, DeliveryState::InFlight);
        let outcome = forwarder.deliver(&batch).await;
        forwarder.tracker.set(batch.sequence, outcome.state);
        outcome
    };

    Completion {
        sequence: batch.sequence,
        first_cursor: batch.first_cursor,
        last_cursor: batch.batch_cursor,
        entry_count: batch.len(),
        outcome,
        permit,
    }
}

async fn report(
    joined: Result<Completion, tokio::task::JoinError>,
    output: &mpsc::Sender<Completion>,
    tracker: &DeliveryTracker,
) -> Result<(), PipelineError> {
    let completion = joined.map_err(|e| PipelineError::DeliveryTask(e.to_string()))?;
    let sequence = completion.sequence;
    output
        .send(completion)
        .await
        .map_err(|_| PipelineError::ChannelSend)?;
    tracker.remove(sequence);
    Ok(())
}
