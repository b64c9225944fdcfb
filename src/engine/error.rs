use super::state::ErrorKind;
use crate::pipeline::batcher::PipelineError;
use crate::source::entry::Cursor;
use crate::source::reader::ReaderError;
use crate::source::traits::Gap;
use crate::storage::traits::CursorStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cursor store error: {0}")]
    CursorStore(#[from] CursorStoreError),

    #[error("source reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("gap in source: {0}")]
    SourceGap(Gap),

    #[error(
        "batch {sequence} ({first_cursor}..={last_cursor}) not delivered after {attempts} attempts: {message}"
    )]
    DeliveryFailed {
        sequence: u64,
        first_cursor: Cursor,
        last_cursor: Cursor,
        attempts: u32,
        message: String,
    },

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::CursorStore(_) => ErrorKind::CursorPersistError,
            EngineError::Reader(_) => ErrorKind::SourceUnavailable,
            EngineError::SourceGap(_) => ErrorKind::SourceGap,
            EngineError::DeliveryFailed { .. } => ErrorKind::SinkFailure,
            EngineError::Pipeline(_) | EngineError::Join(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
