#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tail_forward::backoff::Backoff;
use tail_forward::engine::{EngineHandle, EngineSettings, EngineStatus};
use tail_forward::forwarder::{Sink, SinkError, SinkResponse};
use tail_forward::pipeline::{Batch, BatchLimits};
use tokio::time::Instant;
use uuid::Uuid;

/// How the scripted sink answers one attempt.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Ack,
    Status(u16),
    /// Connection-level failure
    Refused,
    /// Sleep before acking; combine with a short attempt timeout
    Hang(Duration),
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub sequence: u64,
    pub batch_id: Uuid,
    pub messages: Vec<String>,
    pub acked: bool,
    pub at: Instant,
}

/// Sink that answers from a script, then with a fallback reply forever.
pub struct ScriptedSink {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    attempts: Mutex<Vec<Attempt>>,
}

impl ScriptedSink {
    pub fn new(script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn always_ack() -> Arc<Self> {
        Self::new(Vec::new(), Reply::Ack)
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    /// Messages of every acknowledged attempt, in acknowledgement order
    pub fn delivered(&self) -> Vec<String> {
        self.attempts()
            .into_iter()
            .filter(|a| a.acked)
            .flat_map(|a| a.messages)
            .collect()
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }

    fn record(&self, batch: &Batch, acked: bool, at: Instant) {
        let messages = batch
            .entries
            .iter()
            .map(|e| e.field("message").unwrap_or_default().to_string())
            .collect();
        self.attempts.lock().unwrap().push(Attempt {
            sequence: batch.sequence,
            batch_id: batch.batch_id,
            messages,
            acked,
            at,
        });
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn describe(&self) -> String {
        "scripted://test".to_string()
    }

    async fn send(&self, batch: &Batch) -> Result<SinkResponse, SinkError> {
        let at = Instant::now();
        match self.next_reply() {
            Reply::Ack => {
                self.record(batch, true, at);
                Ok(SinkResponse::ok())
            }
            Reply::Status(status) => {
                self.record(batch, false, at);
                Ok(SinkResponse::with_status(status))
            }
            Reply::Refused => {
                self.record(batch, false, at);
                Err(SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
            Reply::Hang(duration) => {
                // Recorded as not acked; a timeout drops this future before it returns
                self.record(batch, false, at);
                tokio::time::sleep(duration).await;
                Ok(SinkResponse::ok())
            }
        }
    }
}

/// Small batches, fast retries and no jitter.
pub fn fast_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.batch = BatchLimits {
        max_entries: 10,
        max_bytes: 64 * 1024,
        max_linger: Duration::from_millis(20),
    };
    settings.reader.poll_interval = Duration::from_millis(10);
    settings.reader.max_retries = 3;
    settings.reader.backoff = fast_backoff();
    settings.delivery.backoff = fast_backoff();
    settings.delivery.max_retries = 3;
    settings.delivery.attempt_timeout = Duration::from_secs(5);
    settings
}

pub fn fast_backoff() -> Backoff {
    Backoff {
        base: Duration::from_millis(10),
        multiplier: 2.0,
        cap: Duration::from_millis(200),
        jitter: 0.0,
    }
}

/// Wait (bounded) until the engine status satisfies `predicate`.
pub async fn wait_until<F>(handle: &EngineHandle, predicate: F) -> EngineStatus
where
    F: FnMut(&EngineStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(predicate))
        .await
        .expect("engine did not reach the expected status in time")
}
