use super::sink::{encode_ndjson, Result, Sink, SinkResponse};
use crate::pipeline::batch::Batch;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

/// Writes newline-delimited JSON entries to a unix stream socket.
///
/// The connection is opened lazily and dropped after any write error, so
/// the next attempt reconnects.
#[derive(Debug)]
pub struct UnixSink {
    path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl UnixSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sink for UnixSink {
    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    async fn send(&self, batch: &Batch) -> Result<SinkResponse> {
        let buf = encode_ndjson(&batch.entries)?;
        let mut guard = self.stream.lock().await;

        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => {
                tracing::debug!(path = %self.path.display(), "Connecting to unix socket");
                UnixStream::connect(&self.path).await?
            }
        };

        stream.write_all(&buf).await?;
        stream.flush().await?;

        *guard = Some(stream);
        Ok(SinkResponse::ok())
    }
}
