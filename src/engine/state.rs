use crate::source::entry::Cursor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Starting,
    /// Replaying entries that existed when the source was opened
    CatchingUp,
    Following,
    /// Stop requested; in-flight batches are finishing
    Draining,
    Stopped,
    Faulted,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Faulted)
    }

    fn can_become(&self, next: EngineState) -> bool {
        use EngineState::*;
        match (*self, next) {
            (Stopped | Faulted, _) => false,
            (_, Faulted) => true,
            (Draining, CatchingUp | Following | Starting) => false,
            (current, next) => current != next,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Starting => "starting",
            EngineState::CatchingUp => "catching_up",
            EngineState::Following => "following",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
            EngineState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Error taxonomy shared by logs, status and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    SourceGap,
    SourceUnavailable,
    SinkFailure,
    CursorPersistError,
    /// A pipeline task died or a channel closed unexpectedly
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::SourceGap => "source_gap",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SinkFailure => "sink_failure",
            ErrorKind::CursorPersistError => "cursor_persist_error",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::ConfigError => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time view of a running engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub committed_cursor: Option<Cursor>,
    /// Tail of the source when it was opened
    pub boundary: Option<Cursor>,
    pub batches_acked: u64,
    pub batches_dropped: u64,
    pub entries_read: u64,
    pub gaps: u64,
    pub outstanding_batches: usize,
    /// Batches currently being sent to the sink
    pub batches_in_flight: usize,
    pub last_error: Option<Fault>,
    pub started_at: DateTime<Utc>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Starting,
            committed_cursor: None,
            boundary: None,
            batches_acked: 0,
            batches_dropped: 0,
            entries_read: 0,
            gaps: 0,
            outstanding_batches: 0,
            batches_in_flight: 0,
            last_error: None,
            started_at: Utc::now(),
        }
    }
}

impl EngineStatus {
    pub fn is_healthy(&self) -> bool {
        self.state != EngineState::Faulted
    }
}

/// Shared writer side of the status channel.
///
/// State changes go through [`StatusPublisher::transition`], which refuses
/// to leave a terminal state or to resume following once draining.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<EngineStatus>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EngineStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> EngineStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.tx.borrow().state
    }

    /// Move to `next` if allowed; returns whether the state changed.
    pub fn transition(&self, next: EngineState) -> bool {
        let mut changed = false;
        self.tx.send_modify(|status| {
            if status.state.can_become(next) {
                tracing::info!(from = %status.state, to = %next, "Engine state change");
                status.state = next;
                changed = true;
            }
        });
        changed
    }

    /// Enter `Faulted`, keeping the first fault if there already is one.
    pub fn fault(&self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|status| {
            if status.state.is_terminal() {
                return;
            }
            tracing::info!(from = %status.state, to = %EngineState::Faulted, kind = %kind, "Engine state change");
            status.state = EngineState::Faulted;
            status.last_error = Some(Fault { kind, message });
        });
    }

    pub fn update(&self, f: impl FnOnce(&mut EngineStatus)) {
        self.tx.send_modify(f);
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}
