use super::entry::{Cursor, Entry};
use super::traits::{Gap, GapReason, LogSource, Result, SeekOutcome, SourceError, SourcePoll};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct MemoryLog {
    entries: VecDeque<Entry>,
    next_offset: u64,
    fail_next: usize,
}

#[derive(Debug)]
struct Shared {
    log: Mutex<MemoryLog>,
    appended: Notify,
}

/// Append side of an in-memory log. Cloning shares the same log.
///
/// Entry offsets start at 1, so the n-th appended entry has cursor `0:n`.
#[derive(Debug, Clone)]
pub struct MemoryLogHandle {
    shared: Arc<Shared>,
}

impl Default for MemoryLogHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(MemoryLog {
                    entries: VecDeque::new(),
                    next_offset: 1,
                    fail_next: 0,
                }),
                appended: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLog> {
        self.shared.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, fields: HashMap<String, String>) -> Cursor {
        let cursor = {
            let mut log = self.lock();
            let cursor = Cursor::at(log.next_offset);
            log.next_offset += 1;
            let raw_size = fields.iter().map(|(k, v)| k.len() + v.len()).sum();
            log.entries.push_back(Entry {
                cursor,
                timestamp: chrono::Utc::now(),
                fields,
                raw_size,
            });
            cursor
        };
        self.shared.appended.notify_one();
        cursor
    }

    pub fn append_message(&self, message: &str) -> Cursor {
        let cursor = {
            let mut log = self.lock();
            let cursor = Cursor::at(log.next_offset);
            log.next_offset += 1;
            log.entries.push_back(Entry::message(cursor, message));
            cursor
        };
        self.shared.appended.notify_one();
        cursor
    }

    /// Drop every entry up to and including `offset`, as retention would.
    pub fn vacuum_through(&self, offset: u64) {
        let mut log = self.lock();
        while log.entries.front().is_some_and(|e| e.cursor.offset <= offset) {
            log.entries.pop_front();
        }
    }

    /// Make the next `count` source calls fail with `SourceError::Unavailable`.
    pub fn fail_next_calls(&self, count: usize) {
        self.lock().fail_next = count;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader over this log, positioned before the oldest entry.
    pub fn source(&self) -> MemorySource {
        MemorySource {
            handle: self.clone(),
            position: 0,
        }
    }
}

impl MemoryLog {
    fn first_available(&self) -> u64 {
        self.entries
            .front()
            .map(|e| e.cursor.offset)
            .unwrap_or(self.next_offset)
    }

    fn last_offset(&self) -> u64 {
        self.next_offset - 1
    }

    fn check_available(&mut self) -> Result<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(SourceError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

/// Read side of an in-memory log.
#[derive(Debug)]
pub struct MemorySource {
    handle: MemoryLogHandle,
    /// Offset of the last entry handed out, 0 before the first
    position: u64,
}

#[async_trait]
impl LogSource for MemorySource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn seek(&mut self, cursor: Option<&Cursor>) -> Result<SeekOutcome> {
        let mut log = self.handle.lock();
        log.check_available()?;

        let first = log.first_available();
        let last = log.last_offset();

        let Some(cursor) = cursor else {
            self.position = first - 1;
            return Ok(SeekOutcome::Exact);
        };

        let (reason, position) = if cursor.offset > last {
            (GapReason::CursorNotFound, last)
        } else if cursor.offset + 1 < first {
            (GapReason::Vacuumed, first - 1)
        } else {
            self.position = cursor.offset;
            return Ok(SeekOutcome::Exact);
        };

        self.position = position;
        Ok(SeekOutcome::Gap(Gap {
            reason,
            expected: Some(*cursor),
            resumed_at: (position > 0).then(|| Cursor::at(position)),
        }))
    }

    async fn next_entry(&mut self) -> Result<SourcePoll> {
        let mut log = self.handle.lock();
        log.check_available()?;

        let first = log.first_available();
        if self.position + 1 < first {
            let gap = Gap {
                reason: GapReason::Vacuumed,
                expected: Some(Cursor::at(self.position)),
                resumed_at: Some(Cursor::at(first - 1)),
            };
            self.position = first - 1;
            return Ok(SourcePoll::Gap(gap));
        }

        let index = (self.position + 1 - first) as usize;
        match log.entries.get(index) {
            Some(entry) => {
                self.position = entry.cursor.offset;
                Ok(SourcePoll::Entry(entry.clone()))
            }
            None => Ok(SourcePoll::Pending),
        }
    }

    async fn tail_cursor(&mut self) -> Result<Option<Cursor>> {
        let mut log = self.handle.lock();
        log.check_available()?;
        let last = log.last_offset();
        Ok((last > 0).then(|| Cursor::at(last)))
    }

    async fn wait_for_data(&mut self, timeout: Duration) -> Result<()> {
        let has_data = {
            let log = self.handle.lock();
            log.last_offset() > self.position
        };
        if has_data {
            return Ok(());
        }

        let _ = tokio::time::timeout(timeout, self.handle.shared.appended.notified()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(source: &mut MemorySource) -> SourcePoll {
        source.next_entry().await.unwrap()
    }

    #[tokio::test]
    async fn test_reads_in_order_then_pending() {
        let log = MemoryLogHandle::new();
        log.append_message("a");
        log.append_message("b");

        let mut source = log.source();
        source.seek(None).await.unwrap();

        let SourcePoll::Entry(a) = next(&mut source).await else { panic!("expected entry") };
        assert_eq!(a.cursor, Cursor::at(1));
        let SourcePoll::Entry(b) = next(&mut source).await else { panic!("expected entry") };
        assert_eq!(b.field("message"), Some("b"));
        assert!(matches!(next(&mut source).await, SourcePoll::Pending));

        log.append_message("c");
        let SourcePoll::Entry(c) = next(&mut source).await else { panic!("expected entry") };
        assert_eq!(c.cursor, Cursor::at(3));
    }

    #[tokio::test]
    async fn test_seek_resumes_after_cursor() {
        let log = MemoryLogHandle::new();
        for m in ["a", "b", "c"] {
            log.append_message(m);
        }

        let mut source = log.source();
        assert!(matches!(
            source.seek(Some(&Cursor::at(2))).await.unwrap(),
            SeekOutcome::Exact
        ));
        let SourcePoll::Entry(c) = next(&mut source).await else { panic!("expected entry") };
        assert_eq!(c.field("message"), Some("c"));
    }

    #[tokio::test]
    async fn test_seek_into_vacuumed_range_reports_gap() {
        let log = MemoryLogHandle::new();
        for m in ["a", "b", "c", "d"] {
            log.append_message(m);
        }
        log.vacuum_through(2);

        let mut source = log.source();
        let SeekOutcome::Gap(gap) = source.seek(Some(&Cursor::at(0))).await.unwrap() else {
            panic!("expected gap");
        };
        assert_eq!(gap.reason, GapReason::Vacuumed);
        assert_eq!(gap.resumed_at, Some(Cursor::at(2)));

        let SourcePoll::Entry(c) = next(&mut source).await else { panic!("expected entry") };
        assert_eq!(c.cursor, Cursor::at(3));
    }

    #[tokio::test]
    async fn test_vacuum_while_reading_reports_gap() {
        let log = MemoryLogHandle::new();
        for m in ["a", "b", "c"] {
            log.append_message(m);
        }
        let mut source = log.source();
        source.seek(None).await.unwrap();
        next(&mut source).await;

        log.vacuum_through(2);
        assert!(matches!(next(&mut source).await, SourcePoll::Gap(_)));
        let SourcePoll::Entry(c) = next(&mut source).await else { panic!("expected entry") };
        assert_eq!(c.cursor, Cursor::at(3));
    }

    #[tokio::test]
    async fn test_seek_past_end_reports_gap() {
        let log = MemoryLogHandle::new();
        log.append_message("a");

        let mut source = log.source();
        let SeekOutcome::Gap(gap) = source.seek(Some(&Cursor::at(10))).await.unwrap() else {
            panic!("expected gap");
        };
        assert_eq!(gap.reason, GapReason::CursorNotFound);
        assert_eq!(gap.resumed_at, Some(Cursor::at(1)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let log = MemoryLogHandle::new();
        log.append_message("a");
        log.fail_next_calls(1);

        let mut source = log.source();
        let err = source.tail_cursor().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(source.tail_cursor().await.unwrap(), Some(Cursor::at(1)));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_append() {
        let log = MemoryLogHandle::new();
        let mut source = log.source();
        source.seek(None).await.unwrap();

        let appender = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            appender.append_message("late");
        });

        source.wait_for_data(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(next(&mut source).await, SourcePoll::Entry(_)));
    }
}
