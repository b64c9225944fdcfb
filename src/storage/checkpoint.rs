use super::traits::{CursorStore, CursorStoreError};
use crate::source::entry::Cursor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CURRENT_VERSION: u32 = 1;

pub type Result<T> = std::result::Result<T, CursorStoreError>;

/// On-disk cursor document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorCheckpoint {
    pub version: u32,
    pub cursor: Cursor,
    pub saved_at: DateTime<Utc>,
    /// Hex SHA-256 of the JSON encoding of `cursor`
    pub checksum: String,
}

impl CursorCheckpoint {
    pub fn new(cursor: Cursor) -> Result<Self> {
        Ok(Self {
            version: CURRENT_VERSION,
            checksum: checksum(&cursor)?,
            cursor,
            saved_at: Utc::now(),
        })
    }

    fn verify(self) -> Result<Cursor> {
        if self.version != CURRENT_VERSION {
            return Err(CursorStoreError::InvalidVersion(self.version));
        }
        let expected = checksum(&self.cursor)?;
        if expected != self.checksum {
            return Err(CursorStoreError::Corrupt(format!(
                "checksum mismatch for cursor {}",
                self.cursor
            )));
        }
        Ok(self.cursor)
    }
}

fn checksum(cursor: &Cursor) -> Result<String> {
    let bytes = serde_json::to_vec(cursor)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Cursor store backed by a single JSON file replaced atomically on save.
#[derive(Debug)]
pub struct FileCursorStore {
    path: PathBuf,
    last_saved: Mutex<Option<Cursor>>,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_saved: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn remember(&self, cursor: Cursor) {
        if let Ok(mut guard) = self.last_saved.lock() {
            *guard = Some(cursor);
        }
    }

    fn is_current(&self, cursor: &Cursor) -> bool {
        self.last_saved
            .lock()
            .map(|guard| guard.as_ref() == Some(cursor))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Option<Cursor>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No cursor file, starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: CursorCheckpoint = serde_json::from_slice(&bytes)
            .map_err(|e| CursorStoreError::Corrupt(e.to_string()))?;
        let saved_at = checkpoint.saved_at;
        let cursor = checkpoint.verify()?;

        tracing::info!(
            path = %self.path.display(),
            cursor = %cursor,
            saved_at = %saved_at,
            "Loaded cursor"
        );
        self.remember(cursor);
        Ok(Some(cursor))
    }

    async fn save(&self, cursor: &Cursor) -> Result<()> {
        if self.is_current(cursor) {
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(&CursorCheckpoint::new(*cursor)?)?;
        let path = self.path.clone();
        let temp = self.temp_path();

        tokio::task::spawn_blocking(move || write_atomic(&path, &temp, &bytes))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        tracing::debug!(path = %self.path.display(), cursor = %cursor, "Saved cursor");
        self.remember(*cursor);
        Ok(())
    }
}

/// Write to `temp`, fsync, rename over `path`, fsync the directory.
fn write_atomic(path: &Path, temp: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(temp, path)?;
    fsync_dir(&dir)
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    // Directories cannot be opened for sync here; rename is the commit point
    Ok(())
}
