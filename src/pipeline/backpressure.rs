use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of closed batches that have not been committed yet.
///
/// The batcher takes a permit before handing a batch downstream; the permit
/// travels with the batch and is dropped by the committer once the delivery
/// result has been applied. With a limit of K, at most K batches are
/// outstanding plus the one the batcher is filling.
#[derive(Debug, Clone)]
pub struct OutstandingLimiter {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl OutstandingLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot. `None` if the semaphore has been closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Batches currently holding a permit
    pub fn outstanding(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}
