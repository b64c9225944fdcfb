use super::sink::{encode_ndjson, Result, Sink, SinkResponse};
use crate::pipeline::batch::Batch;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Appends entries to a local file as newline-delimited JSON.
///
/// A batch counts as delivered once its lines are written and synced.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn send(&self, batch: &Batch) -> Result<SinkResponse> {
        let buf = encode_ndjson(&batch.entries)?;
        let file = self.file.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            file.write_all(&buf)?;
            file.sync_data()
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        Ok(SinkResponse::ok())
    }
}
