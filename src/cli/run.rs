use super::args::Args;
use crate::config::parse::ConfigError;
use crate::engine::{EngineError, EngineReport, EngineSettings, EngineState, ErrorKind, TailEngine};
use crate::forwarder::sink::{sink_from_config, SinkError};
use crate::source::{source_from_config, SourceError};
use crate::storage::{CursorStore, FileCursorStore};
use crate::web::run_status_server;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("source setup failed: {0}")]
    Source(#[from] SourceError),

    #[error("sink setup failed: {0}")]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Config(_) | RunError::Source(_) | RunError::Sink(_) => ErrorKind::ConfigError,
            RunError::Engine(e) => e.kind(),
        }
    }
}

/// Run until stopped by a signal or a fault; returns the process exit code.
pub async fn run(args: Args) -> i32 {
    match run_engine(args).await {
        Ok(report) => {
            if let Some(fault) = &report.error {
                eprintln!("Error: {}: {}", fault.kind, fault.message);
            }
            report.exit_code()
        }
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "tail-forward failed");
            eprintln!("Error: {}", e);
            e.kind().exit_code()
        }
    }
}

async fn run_engine(args: Args) -> Result<EngineReport, RunError> {
    let config = args.build_config()?;

    let source = source_from_config(&config.source)?;
    let sink = sink_from_config(&config.sink)?;
    let store: Arc<dyn CursorStore> = Arc::new(FileCursorStore::new(&config.cursor.path));

    let engine = TailEngine::new(EngineSettings::from_config(&config), source, sink, store);
    let handle = engine.start().await?;

    let server_shutdown = CancellationToken::new();
    let server = config.status.as_ref().map(|status| {
        let listen = status.listen.clone();
        let rx = handle.subscribe();
        let shutdown = server_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(&listen, rx, shutdown).await {
                error!(listen = %listen, error = %e, "Status server failed");
            }
        })
    });

    info!("Forwarding, press Ctrl+C to stop");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        status = handle.wait_for(|s| s.state == EngineState::Faulted) => {
            warn!(state = %status.state, "Engine faulted, draining in-flight batches");
        }
    }

    let report = handle.stop().await?;

    server_shutdown.cancel();
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!(error = %e, "Status server task join error");
        }
    }

    info!(
        state = %report.final_state,
        cursor = ?report.committed_cursor.map(|c| c.to_string()),
        entries_read = report.entries_read,
        batches_acked = report.batches_acked,
        batches_dropped = report.batches_dropped,
        gaps = report.gaps,
        "Shutdown complete"
    );
    Ok(report)
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
