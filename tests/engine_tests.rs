mod common;

use common::{fast_settings, wait_until, Reply, ScriptedSink};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tail_forward::config::types::{FailurePolicy, GapPolicy, StartAt};
use tail_forward::engine::{EngineError, EngineState, ErrorKind, TailEngine};
use tail_forward::forwarder::FileSink;
use tail_forward::source::{Cursor, Entry, FileSource, MemoryLogHandle};
use tail_forward::storage::{CursorStore, FileCursorStore, MemoryCursorStore};
use tempfile::TempDir;

fn log_with(messages: &[&str]) -> MemoryLogHandle {
    let log = MemoryLogHandle::new();
    for message in messages {
        log.append_message(message);
    }
    log
}

#[tokio::test]
async fn test_forwards_backlog_and_commits_last_cursor() {
    let log = log_with(&["A", "B", "C"]);
    let sink = ScriptedSink::always_ack();
    let store = Arc::new(MemoryCursorStore::new());

    let handle = TailEngine::new(fast_settings(), Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();

    wait_until(&handle, |s| s.committed_cursor == Some(Cursor::at(3))).await;
    let report = handle.stop().await.unwrap();

    assert_eq!(report.final_state, EngineState::Stopped);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(store.current(), Some(Cursor::at(3)));
    assert_eq!(sink.delivered(), vec!["A", "B", "C"]);

    let sequences: Vec<u64> = sink.attempts().iter().map(|a| a.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort();
    assert_eq!(sequences, sorted);
}

#[tokio::test]
async fn test_retries_failed_batch_until_acked() {
    let log = log_with(&["A", "B", "C", "D"]);
    let sink = ScriptedSink::new(vec![Reply::Status(503), Reply::Refused], Reply::Ack);
    let store = Arc::new(MemoryCursorStore::with_cursor(Cursor::at(3)));

    let handle = TailEngine::new(fast_settings(), Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();

    wait_until(&handle, |s| s.committed_cursor == Some(Cursor::at(4))).await;
    handle.stop().await.unwrap();

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.messages == vec!["D"]));
    assert!(attempts.iter().all(|a| a.batch_id == attempts[0].batch_id));

    // Backoff of 10ms then 20ms
    assert!(attempts[1].at - attempts[0].at >= Duration::from_millis(10));
    assert!(attempts[2].at - attempts[1].at >= Duration::from_millis(20));
    assert_eq!(store.history(), vec![Cursor::at(4)]);
}

#[tokio::test]
async fn test_restart_after_failed_delivery_redelivers() {
    let log = log_with(&["A", "B", "C", "D"]);
    let store = Arc::new(MemoryCursorStore::with_cursor(Cursor::at(3)));

    // First run: the sink never accepts, so the engine halts with the cursor untouched
    let failing = ScriptedSink::new(Vec::new(), Reply::Status(500));
    let mut settings = fast_settings();
    settings.delivery.max_retries = 1;
    let handle = TailEngine::new(settings, Box::new(log.source()), failing.clone(), store.clone())
        .start()
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.final_state, EngineState::Faulted);
    assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::SinkFailure);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(failing.attempts().len(), 2);
    assert_eq!(store.current(), Some(Cursor::at(3)));

    // Second run resumes from the saved cursor and delivers D again
    let sink = ScriptedSink::always_ack();
    let handle = TailEngine::new(fast_settings(), Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();
    wait_until(&handle, |s| s.committed_cursor == Some(Cursor::at(4))).await;
    handle.stop().await.unwrap();

    assert_eq!(sink.delivered(), vec!["D"]);
    assert_eq!(store.current(), Some(Cursor::at(4)));
}

#[tokio::test]
async fn test_no_entry_skipped_across_restarts() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("app.log");
    let cursor_path = dir.path().join("state").join("app.cursor.json");

    let mut file = std::fs::File::create(&log_path).unwrap();
    for i in 0..50 {
        writeln!(file, "line {}", i).unwrap();
    }
    file.flush().unwrap();

    let mut delivered = Vec::new();
    for round in 0..3 {
        let source = FileSource::new(log_path.clone(), None, Duration::from_millis(10));
        let store = Arc::new(FileCursorStore::new(&cursor_path));
        let sink = ScriptedSink::always_ack();

        let handle = TailEngine::new(fast_settings(), Box::new(source), sink.clone(), store)
            .start()
            .await
            .unwrap();

        let len = std::fs::metadata(&log_path).unwrap().len();
        wait_until(&handle, |s| s.committed_cursor.map(|c| c.offset) == Some(len)).await;

        // Append while the engine is following
        for i in 0..20 {
            writeln!(file, "round {} extra {}", round, i).unwrap();
        }
        file.flush().unwrap();
        let len = std::fs::metadata(&log_path).unwrap().len();
        wait_until(&handle, |s| s.committed_cursor.map(|c| c.offset) == Some(len)).await;

        handle.stop().await.unwrap();
        delivered.extend(sink.delivered());
    }

    let expected: Vec<String> = std::fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    let seen: HashSet<&String> = delivered.iter().collect();
    assert_eq!(expected.len(), 110);
    assert!(expected.iter().all(|line| seen.contains(line)));

    let saved = FileCursorStore::new(&cursor_path).load().await.unwrap().unwrap();
    assert_eq!(saved.offset, std::fs::metadata(&log_path).unwrap().len());
}

#[tokio::test]
async fn test_outstanding_batches_are_bounded() {
    let log = MemoryLogHandle::new();
    for i in 0..20 {
        log.append_message(&format!("entry {}", i));
    }

    let sink = ScriptedSink::new(Vec::new(), Reply::Hang(Duration::from_secs(3600)));
    let mut settings = fast_settings();
    settings.max_outstanding = 2;
    settings.batch.max_entries = 1;
    settings.delivery.max_in_flight = 4;
    settings.delivery.max_retries = 0;
    settings.delivery.attempt_timeout = Duration::from_millis(500);

    let handle = TailEngine::new(settings, Box::new(log.source()), sink.clone(), Arc::new(MemoryCursorStore::new()))
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Two batches at the sink, one closed batch waiting for a permit and
    // two entries queued. The entry the reader is still holding is not counted.
    let in_flight: HashSet<u64> = sink.attempts().iter().map(|a| a.sequence).collect();
    assert_eq!(in_flight, HashSet::from([0, 1]));
    let status = handle.status();
    assert_eq!(status.entries_read, 5);
    assert_eq!(status.batches_in_flight, 2);

    let report = handle.stop().await.unwrap();
    assert_eq!(report.final_state, EngineState::Faulted);
    assert_eq!(report.committed_cursor, None);
}

#[tokio::test]
async fn test_backlog_then_follow_through_engine() {
    let log = MemoryLogHandle::new();
    for i in 1..=1000 {
        log.append_message(&format!("entry {}", i));
    }

    let sink = ScriptedSink::always_ack();
    let mut settings = fast_settings();
    settings.batch.max_entries = 100;

    let handle = TailEngine::new(settings, Box::new(log.source()), sink.clone(), Arc::new(MemoryCursorStore::new()))
        .start()
        .await
        .unwrap();
    assert_eq!(handle.status().boundary, Some(Cursor::at(1000)));

    wait_until(&handle, |s| s.state == EngineState::Following).await;
    log.append_message("entry 1001");
    wait_until(&handle, |s| s.committed_cursor == Some(Cursor::at(1001))).await;
    let report = handle.stop().await.unwrap();

    let expected: Vec<String> = (1..=1001).map(|i| format!("entry {}", i)).collect();
    assert_eq!(sink.delivered(), expected);
    assert_eq!(report.entries_read, 1001);
}

#[tokio::test]
async fn test_drop_policy_skips_undeliverable_batch() {
    let log = log_with(&["A", "B"]);
    let sink = ScriptedSink::new(vec![Reply::Status(500), Reply::Status(500)], Reply::Ack);
    let store = Arc::new(MemoryCursorStore::new());

    let mut settings = fast_settings();
    settings.batch.max_entries = 1;
    settings.delivery.max_retries = 1;
    settings.on_failure = FailurePolicy::Drop;

    let handle = TailEngine::new(settings, Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();
    let status = wait_until(&handle, |s| s.committed_cursor == Some(Cursor::at(2))).await;
    let report = handle.stop().await.unwrap();

    assert_eq!(status.batches_dropped, 1);
    assert_eq!(status.batches_acked, 1);
    assert_eq!(sink.delivered(), vec!["B"]);
    assert_eq!(report.final_state, EngineState::Stopped);
    assert_eq!(store.history(), vec![Cursor::at(1), Cursor::at(2)]);
}

#[tokio::test]
async fn test_halt_policy_faults_before_failed_batch() {
    let log = log_with(&["A", "B"]);
    let sink = ScriptedSink::new(vec![Reply::Status(500), Reply::Status(500)], Reply::Ack);
    let store = Arc::new(MemoryCursorStore::new());

    let mut settings = fast_settings();
    settings.batch.max_entries = 1;
    settings.delivery.max_retries = 1;

    let handle = TailEngine::new(settings, Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.final_state, EngineState::Faulted);
    assert_eq!(report.error.unwrap().kind, ErrorKind::SinkFailure);
    assert_eq!(store.current(), None);
}

#[tokio::test]
async fn test_cursor_persist_failure_faults_engine() {
    let log = log_with(&["A"]);
    let store = Arc::new(MemoryCursorStore::new());
    store.fail_next_saves(1);

    let handle = TailEngine::new(fast_settings(), Box::new(log.source()), ScriptedSink::always_ack(), store.clone())
        .start()
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.final_state, EngineState::Faulted);
    assert_eq!(report.error.unwrap().kind, ErrorKind::CursorPersistError);
    assert_eq!(store.current(), None);
}

#[tokio::test]
async fn test_gap_policies() {
    let log = log_with(&["A", "B", "C"]);
    log.vacuum_through(2);

    // skip: continue after the vacuumed range
    let sink = ScriptedSink::always_ack();
    let store = Arc::new(MemoryCursorStore::with_cursor(Cursor::at(1)));
    let handle = TailEngine::new(fast_settings(), Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();
    let status = wait_until(&handle, |s| s.committed_cursor == Some(Cursor::at(3))).await;
    handle.stop().await.unwrap();
    assert_eq!(status.gaps, 1);
    assert_eq!(sink.delivered(), vec!["C"]);

    // fail: fault without forwarding anything
    let sink = ScriptedSink::always_ack();
    let store = Arc::new(MemoryCursorStore::with_cursor(Cursor::at(1)));
    let mut settings = fast_settings();
    settings.on_gap = GapPolicy::Fail;
    let handle = TailEngine::new(settings, Box::new(log.source()), sink.clone(), store.clone())
        .start()
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.error.unwrap().kind, ErrorKind::SourceGap);
    assert!(sink.delivered().is_empty());
    assert_eq!(store.current(), Some(Cursor::at(1)));
}

#[tokio::test]
async fn test_corrupt_cursor_file_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let cursor_path = dir.path().join("cursor.json");
    std::fs::write(&cursor_path, b"{ not json").unwrap();

    let result = TailEngine::new(
        fast_settings(),
        Box::new(MemoryLogHandle::new().source()),
        ScriptedSink::always_ack(),
        Arc::new(FileCursorStore::new(&cursor_path)),
    )
    .start()
    .await;

    let Err(e) = result else { panic!("engine started with a corrupt cursor") };
    assert!(matches!(e, EngineError::CursorStore(_)));
    assert_eq!(e.kind(), ErrorKind::CursorPersistError);
}

#[tokio::test]
async fn test_file_to_file_forwarding() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("app.log");
    let out_path = dir.path().join("out.ndjson");
    std::fs::write(&log_path, "first\nsecond\nthird\n").unwrap();

    let handle = TailEngine::new(
        fast_settings(),
        Box::new(FileSource::new(log_path.clone(), None, Duration::from_millis(10))),
        Arc::new(FileSink::open(&out_path).unwrap()),
        Arc::new(FileCursorStore::new(dir.path().join("cursor.json"))),
    )
    .start()
    .await
    .unwrap();

    wait_until(&handle, |s| s.committed_cursor.map(|c| c.offset) == Some(19)).await;
    handle.stop().await.unwrap();

    let entries: Vec<Entry> = std::fs::read_to_string(&out_path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let messages: Vec<&str> = entries.iter().map(|e| e.field("message").unwrap()).collect();
    assert_eq!(messages, vec!["first", "second", "third"]);
    assert_eq!(entries[2].field("path"), Some(log_path.to_str().unwrap()));
}

fn append(path: &std::path::Path, text: &str) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

#[tokio::test]
async fn test_file_backlog_boundary_then_following() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("app.log");
    let backlog: String = (0..20).map(|i| format!("line {:02}\n", i)).collect();
    std::fs::write(&log_path, &backlog).unwrap();
    let len = backlog.len() as u64;

    // The first batch stalls, holding the reader inside the backlog
    let sink = ScriptedSink::new(vec![Reply::Hang(Duration::from_millis(300))], Reply::Ack);
    let mut settings = fast_settings();
    settings.max_outstanding = 1;
    settings.batch.max_entries = 1;

    let handle = TailEngine::new(
        settings,
        Box::new(FileSource::new(log_path.clone(), None, Duration::from_millis(10))),
        sink.clone(),
        Arc::new(MemoryCursorStore::new()),
    )
    .start()
    .await
    .unwrap();

    let status = handle.status();
    assert_eq!(status.state, EngineState::CatchingUp);
    let boundary = status.boundary.expect("non-empty file has a boundary");
    assert_eq!((boundary.generation, boundary.offset), (0, len));

    let following = wait_until(&handle, |s| s.state == EngineState::Following).await;
    assert_eq!(following.entries_read, 20);
    assert_eq!(following.boundary, Some(boundary));

    append(&log_path, "line 20\n");
    let status = wait_until(&handle, |s| s.committed_cursor.map(|c| c.offset) == Some(len + 8)).await;
    assert_eq!(status.committed_cursor.unwrap().generation, 0);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_file_start_at_end_forwards_only_new_lines() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("app.log");
    std::fs::write(&log_path, "old one\nold two\n").unwrap();

    let sink = ScriptedSink::always_ack();
    let mut settings = fast_settings();
    settings.reader.start_at = StartAt::End;

    let handle = TailEngine::new(
        settings,
        Box::new(FileSource::new(log_path.clone(), None, Duration::from_millis(10))),
        sink.clone(),
        Arc::new(MemoryCursorStore::new()),
    )
    .start()
    .await
    .unwrap();

    wait_until(&handle, |s| s.state == EngineState::Following).await;
    append(&log_path, "new\n");
    wait_until(&handle, |s| s.committed_cursor.map(|c| c.offset) == Some(20)).await;
    let report = handle.stop().await.unwrap();

    assert_eq!(sink.delivered(), vec!["new"]);
    assert_eq!(report.entries_read, 1);
}
