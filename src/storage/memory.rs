use super::traits::{CursorStore, CursorStoreError};
use crate::source::entry::Cursor;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<Cursor>,
    history: Vec<Cursor>,
    fail_saves: usize,
}

/// Cursor store kept in process memory.
///
/// Records every value that was actually written, and can be told to
/// reject upcoming saves to simulate a disk that stops accepting writes.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    state: Mutex<MemoryState>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: Cursor) -> Self {
        let store = Self::new();
        store.lock().current = Some(cursor);
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> Option<Cursor> {
        self.lock().current
    }

    /// Every cursor written so far, oldest first
    pub fn history(&self) -> Vec<Cursor> {
        self.lock().history.clone()
    }

    pub fn fail_next_saves(&self, count: usize) {
        self.lock().fail_saves = count;
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<Cursor>, CursorStoreError> {
        Ok(self.current())
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), CursorStoreError> {
        let mut state = self.lock();
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(CursorStoreError::Rejected(format!(
                "injected failure saving {}",
                cursor
            )));
        }
        if state.current == Some(*cursor) {
            return Ok(());
        }
        state.current = Some(*cursor);
        state.history.push(*cursor);
        Ok(())
    }
}
