use crate::source::entry::Cursor;
use async_trait::async_trait;

/// Durable home of the last forwarded position.
///
/// Only the engine's committer calls `save`; everything else reads the
/// cursor once at startup through `load`.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Cursor>, CursorStoreError>;

    /// Persist `cursor` so that a crash at any point leaves either the
    /// previous value or `cursor` readable. Saving the current value again
    /// is a no-op.
    async fn save(&self, cursor: &Cursor) -> Result<(), CursorStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CursorStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cursor file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported cursor file version: {0}")]
    InvalidVersion(u32),

    #[error("cursor file is corrupt: {0}")]
    Corrupt(String),

    #[error("cursor save rejected: {0}")]
    Rejected(String),
}
