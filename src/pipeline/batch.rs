use crate::source::entry::{Cursor, Entry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    /// Unique batch ID, resent unchanged with every attempt (for deduplication)
    pub batch_id: Uuid,

    /// Monotonic per-run sequence number, starting at 0
    pub sequence: u64,

    /// Contiguous entries in source order
    pub entries: Vec<Entry>,

    /// Cursor of the first entry
    pub first_cursor: Cursor,

    /// Cursor of the last entry; what the cursor store advances to on ack
    pub batch_cursor: Cursor,

    pub raw_bytes: usize,

    pub closed_at: DateTime<Utc>,
}

impl Batch {
    /// Close `entries` into a batch. `None` if there is nothing to send.
    pub fn new(sequence: u64, entries: Vec<Entry>) -> Option<Self> {
        let first_cursor = entries.first()?.cursor;
        let batch_cursor = entries.last()?.cursor;
        let raw_bytes = entries.iter().map(|e| e.raw_size).sum();

        Some(Self {
            batch_id: Uuid::new_v4(),
            sequence,
            entries,
            first_cursor,
            batch_cursor,
            raw_bytes,
            closed_at: Utc::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lifecycle of a batch between closing and commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Acked,
    /// Sink failure; carries the number of retries made so far
    Failed(u32),
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Failed(_))
    }
}
