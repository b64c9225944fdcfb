use super::committer::{run_committer, Committer};
use super::error::{EngineError, Result};
use super::state::{EngineState, EngineStatus, Fault, StatusPublisher};
use crate::config::types::{Config, FailurePolicy, GapPolicy};
use crate::forwarder::delivery::{run_forwarder, DeliverySettings, DeliveryTracker, Forwarder};
use crate::forwarder::sink::Sink;
use crate::pipeline::backpressure::OutstandingLimiter;
use crate::pipeline::batcher::{run_batcher, BatchLimits, Batcher, PipelineError};
use crate::pipeline::channel::create_channel;
use crate::source::entry::{Cursor, Entry};
use crate::source::reader::{ReadEvent, ReaderSettings, SourceReader};
use crate::source::traits::LogSource;
use crate::storage::traits::CursorStore;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub reader: ReaderSettings,
    pub batch: BatchLimits,
    pub delivery: DeliverySettings,
    /// Closed batches allowed to wait for commit at once
    pub max_outstanding: usize,
    pub on_gap: GapPolicy,
    pub on_failure: FailurePolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reader: ReaderSettings::from_config(&config.source, &config.delivery.backoff),
            batch: BatchLimits::from_config(&config.batch),
            delivery: DeliverySettings::from_config(&config.delivery, &config.sink),
            max_outstanding: config.delivery.max_outstanding.max(1),
            on_gap: config.source.on_gap,
            on_failure: config.delivery.on_failure,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Summary returned once the engine has finished.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub final_state: EngineState,
    pub committed_cursor: Option<Cursor>,
    pub batches_acked: u64,
    pub batches_dropped: u64,
    pub entries_read: u64,
    pub gaps: u64,
    pub error: Option<Fault>,
}

impl EngineReport {
    fn from_status(status: &EngineStatus) -> Self {
        Self {
            final_state: status.state,
            committed_cursor: status.committed_cursor,
            batches_acked: status.batches_acked,
            batches_dropped: status.batches_dropped,
            entries_read: status.entries_read,
            gaps: status.gaps,
            error: status.last_error.clone(),
        }
    }

    /// 0 after a clean stop, otherwise the code for the fault's kind
    pub fn exit_code(&self) -> i32 {
        match &self.error {
            Some(fault) => fault.kind.exit_code(),
            None if self.final_state == EngineState::Faulted => 2,
            None => 0,
        }
    }
}

/// Reader → batcher → forwarder → committer, wired together.
pub struct TailEngine {
    settings: EngineSettings,
    source: Box<dyn LogSource>,
    sink: Arc<dyn Sink>,
    store: Arc<dyn CursorStore>,
}

impl TailEngine {
    pub fn new(
        settings: EngineSettings,
        source: Box<dyn LogSource>,
        sink: Arc<dyn Sink>,
        store: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            settings,
            source,
            sink,
            store,
        }
    }

    /// Load the cursor, open the source and spawn the pipeline tasks.
    ///
    /// Fails without spawning anything if the saved cursor cannot be read
    /// or the source cannot be opened.
    pub async fn start(self) -> Result<EngineHandle> {
        let TailEngine {
            settings,
            source,
            sink,
            store,
        } = self;

        let status = StatusPublisher::new();
        // A fault cancels `halt`; `shutdown` is its child so a fault also stops the reader
        let halt = CancellationToken::new();
        let shutdown = halt.child_token();

        let committed = store.load().await?;
        let reader =
            SourceReader::open(source, committed, settings.reader.clone(), shutdown.clone()).await?;

        info!(
            source = %reader.describe(),
            sink = %sink.describe(),
            cursor = ?committed.map(|c| c.to_string()),
            boundary = ?reader.boundary().map(|c| c.to_string()),
            max_outstanding = settings.max_outstanding,
            "Starting tail engine"
        );

        status.update(|s| {
            s.committed_cursor = committed;
            s.boundary = reader.boundary();
        });
        status.transition(EngineState::CatchingUp);

        let limiter = OutstandingLimiter::new(settings.max_outstanding);
        let (entry_tx, entry_rx) = create_channel(settings.max_outstanding);
        let (batch_tx, batch_rx) = create_channel(settings.max_outstanding);
        let (done_tx, done_rx) = create_channel(settings.max_outstanding);

        let reader_task = spawn_stage(
            "reader",
            run_reader(reader, entry_tx, status.clone(), settings.on_gap, shutdown.clone()),
            &status,
            &halt,
        );
        let batcher_task = spawn_stage(
            "batcher",
            {
                let limiter = limiter.clone();
                let batcher = Batcher::new(settings.batch);
                async move {
                    run_batcher(entry_rx, batch_tx, batcher, limiter)
                        .await
                        .map_err(EngineError::from)
                }
            },
            &status,
            &halt,
        );

        let tracker = {
            let status = status.clone();
            DeliveryTracker::new().on_change(move |counts| {
                status.update(|s| s.batches_in_flight = counts.in_flight)
            })
        };
        let forwarder =
            Arc::new(Forwarder::new(sink, settings.delivery.clone()).with_tracker(tracker));
        let forwarder_task = spawn_stage(
            "forwarder",
            {
                let halt = halt.clone();
                async move {
                    run_forwarder(batch_rx, done_tx, forwarder, halt)
                        .await
                        .map_err(EngineError::from)
                }
            },
            &status,
            &halt,
        );

        let committer = Committer::new(store, settings.on_failure, status.clone(), committed)
            .with_limiter(limiter);
        let committer_task = tokio::spawn(run_committer(done_rx, committer, halt.clone()));

        let supervisor = tokio::spawn(supervise(
            status.clone(),
            [reader_task, batcher_task, forwarder_task],
            committer_task,
        ));

        Ok(EngineHandle {
            status,
            shutdown,
            supervisor,
        })
    }
}

/// Spawn a pipeline stage that faults the engine if it fails.
fn spawn_stage<F>(
    name: &'static str,
    stage: F,
    status: &StatusPublisher,
    halt: &CancellationToken,
) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let status = status.clone();
    let halt = halt.clone();
    tokio::spawn(async move {
        let result = stage.await;
        if let Err(e) = &result {
            error!(kind = %e.kind(), stage = name, error = %e, "Engine stage failed");
            status.fault(e.kind(), e.to_string());
            halt.cancel();
        }
        result
    })
}

/// Pull events from the reader and feed entries to the batcher.
async fn run_reader(
    mut reader: SourceReader,
    output: mpsc::Sender<Entry>,
    status: StatusPublisher,
    on_gap: GapPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(source = %reader.describe(), "Reader started");

    while let Some(event) = reader.next_event().await? {
        match event {
            ReadEvent::Entry(entry) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = output.send(entry) => {
                        if sent.is_err() {
                            return Err(PipelineError::ChannelSend.into());
                        }
                    }
                }
                // Counted only once the batcher has it
                status.update(|s| s.entries_read += 1);
            }
            ReadEvent::CaughtUp { .. } => {
                status.transition(EngineState::Following);
            }
            ReadEvent::Gap(gap) => {
                status.update(|s| s.gaps += 1);
                match on_gap {
                    GapPolicy::Skip => {
                        warn!(
                            kind = "source_gap",
                            reason = %gap.reason,
                            expected = ?gap.expected.map(|c| c.to_string()),
                            resumed_at = ?gap.resumed_at.map(|c| c.to_string()),
                            "Gap in source, skipping ahead"
                        );
                    }
                    GapPolicy::Fail => return Err(EngineError::SourceGap(gap)),
                }
            }
        }
    }

    info!(last = ?reader.last_cursor().map(|c| c.to_string()), "Reader stopped");
    Ok(())
}

/// Await every task in pipeline order, then settle the final state.
async fn supervise(
    status: StatusPublisher,
    stages: [JoinHandle<Result<()>>; 3],
    committer: JoinHandle<Result<Option<Cursor>>>,
) -> EngineReport {
    for stage in stages {
        if let Err(e) = stage.await {
            let e = EngineError::from(e);
            status.fault(e.kind(), e.to_string());
        }
    }
    match committer.await {
        Ok(_) => {}
        Err(e) => {
            let e = EngineError::from(e);
            status.fault(e.kind(), e.to_string());
        }
    }

    status.transition(EngineState::Stopped);
    let report = EngineReport::from_status(&status.snapshot());
    info!(
        state = %report.final_state,
        cursor = ?report.committed_cursor.map(|c| c.to_string()),
        batches_acked = report.batches_acked,
        "Tail engine finished"
    );
    report
}

/// Control handle for a running engine.
pub struct EngineHandle {
    status: StatusPublisher,
    shutdown: CancellationToken,
    supervisor: JoinHandle<EngineReport>,
}

impl EngineHandle {
    pub fn status(&self) -> EngineStatus {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Resolve once the status satisfies `predicate`, or the engine is gone.
    pub async fn wait_for<F>(&self, mut predicate: F) -> EngineStatus
    where
        F: FnMut(&EngineStatus) -> bool,
    {
        let mut rx = self.status.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) || current.state.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Request a clean stop and wait for the pipeline to drain.
    pub async fn stop(self) -> Result<EngineReport> {
        info!("Stop requested, draining");
        self.status.transition(EngineState::Draining);
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for the engine to finish on its own.
    pub async fn wait(self) -> Result<EngineReport> {
        Ok(self.supervisor.await?)
    }
}
