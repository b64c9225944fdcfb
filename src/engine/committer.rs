use super::error::{EngineError, Result};
use super::state::StatusPublisher;
use crate::config::types::FailurePolicy;
use crate::forwarder::delivery::Completion;
use crate::pipeline::backpressure::OutstandingLimiter;
use crate::pipeline::batch::DeliveryState;
use crate::source::entry::Cursor;
use crate::storage::traits::CursorStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Sole writer of the cursor store.
///
/// Delivery results may arrive out of order; they are parked until every
/// earlier sequence has been resolved, so the saved cursor never passes a
/// batch that is still pending.
pub struct Committer {
    store: Arc<dyn CursorStore>,
    policy: FailurePolicy,
    status: StatusPublisher,
    limiter: Option<OutstandingLimiter>,
    next_sequence: u64,
    parked: BTreeMap<u64, Completion>,
    committed: Option<Cursor>,
    /// Set once a batch resolved without delivery; nothing after it may commit
    stalled: bool,
}

impl Committer {
    pub fn new(
        store: Arc<dyn CursorStore>,
        policy: FailurePolicy,
        status: StatusPublisher,
        committed: Option<Cursor>,
    ) -> Self {
        Self {
            store,
            policy,
            status,
            limiter: None,
            next_sequence: 0,
            parked: BTreeMap::new(),
            committed,
            stalled: false,
        }
    }

    /// Report `limiter.outstanding()` in the status after each result
    pub fn with_limiter(mut self, limiter: OutstandingLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn committed(&self) -> Option<Cursor> {
        self.committed
    }

    /// Apply one delivery result, committing every batch it unblocks.
    pub async fn apply(&mut self, completion: Completion) -> Result<()> {
        if self.stalled || completion.sequence < self.next_sequence {
            return Ok(());
        }
        self.parked.insert(completion.sequence, completion);

        while let Some(completion) = self.parked.remove(&self.next_sequence) {
            let resolved = self.resolve(&completion).await;
            // Permit goes back to the batcher here, after the result is applied
            drop(completion);
            if resolved.is_err() || self.stalled {
                self.parked.clear();
                resolved?;
                break;
            }
            self.next_sequence += 1;
        }

        if let Some(limiter) = &self.limiter {
            let outstanding = limiter.outstanding();
            self.status.update(|s| s.outstanding_batches = outstanding);
        }
        Ok(())
    }

    async fn resolve(&mut self, completion: &Completion) -> Result<()> {
        match completion.outcome.state {
            DeliveryState::Acked => {
                self.commit(completion.last_cursor).await?;
                self.status.update(|s| s.batches_acked += 1);
                debug!(
                    sequence = completion.sequence,
                    cursor = %completion.last_cursor,
                    entries = completion.entry_count,
                    "Committed batch"
                );
            }
            DeliveryState::Failed(_) => match self.policy {
                FailurePolicy::Halt => {
                    self.stalled = true;
                    return Err(EngineError::DeliveryFailed {
                        sequence: completion.sequence,
                        first_cursor: completion.first_cursor,
                        last_cursor: completion.last_cursor,
                        attempts: completion.outcome.attempts,
                        message: completion.outcome.last_error.clone().unwrap_or_default(),
                    });
                }
                FailurePolicy::Drop => {
                    error!(
                        kind = "sink_failure",
                        sequence = completion.sequence,
                        first = %completion.first_cursor,
                        last = %completion.last_cursor,
                        entries = completion.entry_count,
                        attempts = completion.outcome.attempts,
                        "Dropping undeliverable batch"
                    );
                    self.commit(completion.last_cursor).await?;
                    self.status.update(|s| s.batches_dropped += 1);
                }
            },
            DeliveryState::Pending | DeliveryState::InFlight => {
                info!(
                    sequence = completion.sequence,
                    first = %completion.first_cursor,
                    "Batch was not delivered, cursor stays put"
                );
                self.stalled = true;
            }
        }
        Ok(())
    }

    async fn commit(&mut self, cursor: Cursor) -> Result<()> {
        if let Err(e) = self.store.save(&cursor).await {
            self.stalled = true;
            error!(
                kind = "cursor_persist_error",
                cursor = %cursor,
                error = %e,
                "Failed to save cursor"
            );
            return Err(e.into());
        }
        self.committed = Some(cursor);
        self.status.update(|s| s.committed_cursor = Some(cursor));
        Ok(())
    }
}

/// Run the committer task.
///
/// On the first error the engine is faulted and `halt` is cancelled; the
/// remaining results are still received so their permits are released.
pub async fn run_committer(
    mut input: mpsc::Receiver<Completion>,
    mut committer: Committer,
    halt: CancellationToken,
) -> Result<Option<Cursor>> {
    let mut failure = None;

    while let Some(completion) = input.recv().await {
        if failure.is_some() {
            continue;
        }
        if let Err(e) = committer.apply(completion).await {
            committer.status.fault(e.kind(), e.to_string());
            halt.cancel();
            failure = Some(e);
        }
    }

    match failure {
        Some(e) => Err(e),
        None => {
            let committed = committer.committed();
            info!(cursor = ?committed.map(|c| c.to_string()), "Committer stopped");
            Ok(committed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{EngineState, ErrorKind};
    use crate::forwarder::delivery::DeliveryOutcome;
    use crate::storage::memory::MemoryCursorStore;

    struct Fixture {
        store: Arc<MemoryCursorStore>,
        status: StatusPublisher,
        limiter: OutstandingLimiter,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryCursorStore::new()),
                status: StatusPublisher::new(),
                limiter: OutstandingLimiter::new(8),
            }
        }

        fn committer(&self, policy: FailurePolicy) -> Committer {
            Committer::new(self.store.clone(), policy, self.status.clone(), None)
                .with_limiter(self.limiter.clone())
        }

        async fn completion(&self, sequence: u64, state: DeliveryState) -> Completion {
            Completion {
                sequence,
                first_cursor: Cursor::at(sequence * 10 + 1),
                last_cursor: Cursor::at(sequence * 10 + 10),
                entry_count: 10,
                outcome: DeliveryOutcome {
                    state,
                    attempts: 1,
                    last_error: None,
                },
                permit: self.limiter.acquire().await.unwrap(),
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_order_ack_waits_for_earlier_batch() {
        let fx = Fixture::new();
        let mut committer = fx.committer(FailurePolicy::Halt);

        let second = fx.completion(1, DeliveryState::Acked).await;
        let first = fx.completion(0, DeliveryState::Acked).await;

        committer.apply(second).await.unwrap();
        assert_eq!(fx.store.current(), None);
        assert_eq!(committer.parked.len(), 1);
        assert_eq!(fx.limiter.outstanding(), 2);

        committer.apply(first).await.unwrap();
        assert_eq!(fx.store.history(), vec![Cursor::at(10), Cursor::at(20)]);
        assert_eq!(fx.limiter.outstanding(), 0);
        assert_eq!(fx.status.snapshot().batches_acked, 2);
    }

    #[tokio::test]
    async fn test_halt_keeps_cursor_before_failed_batch() {
        let fx = Fixture::new();
        let mut committer = fx.committer(FailurePolicy::Halt);

        committer
            .apply(fx.completion(0, DeliveryState::Acked).await)
            .await
            .unwrap();
        let result = committer
            .apply(fx.completion(1, DeliveryState::Failed(5)).await)
            .await;
        assert!(matches!(result, Err(EngineError::DeliveryFailed { sequence: 1, .. })));

        committer
            .apply(fx.completion(2, DeliveryState::Acked).await)
            .await
            .unwrap();
        assert_eq!(fx.store.current(), Some(Cursor::at(10)));
        assert_eq!(fx.limiter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drop_advances_past_failed_batch() {
        let fx = Fixture::new();
        let mut committer = fx.committer(FailurePolicy::Drop);

        committer
            .apply(fx.completion(0, DeliveryState::Failed(5)).await)
            .await
            .unwrap();
        committer
            .apply(fx.completion(1, DeliveryState::Acked).await)
            .await
            .unwrap();

        assert_eq!(fx.store.current(), Some(Cursor::at(20)));
        let status = fx.status.snapshot();
        assert_eq!((status.batches_acked, status.batches_dropped), (1, 1));
    }

    #[tokio::test]
    async fn test_persist_failure_faults_engine() {
        let fx = Fixture::new();
        fx.store.fail_next_saves(1);
        let halt = CancellationToken::new();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run_committer(
            rx,
            fx.committer(FailurePolicy::Halt),
            halt.clone(),
        ));
        tx.send(fx.completion(0, DeliveryState::Acked).await).await.unwrap();
        tx.send(fx.completion(1, DeliveryState::Acked).await).await.unwrap();
        drop(tx);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(EngineError::CursorStore(_))));
        assert!(halt.is_cancelled());
        assert_eq!(fx.store.current(), None);

        let status = fx.status.snapshot();
        assert_eq!(status.state, EngineState::Faulted);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::CursorPersistError);
        assert_eq!(fx.limiter.outstanding(), 0);
    }
}
