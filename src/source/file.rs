use super::entry::{Cursor, Entry};
use super::timestamp::TimestampExtractor;
use super::traits::{Gap, GapReason, LogSource, Result, SeekOutcome, SourceError, SourcePoll};
use crate::config::types::SourceConfig;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Line-oriented text file followed like `tail -F`.
///
/// Each complete line is one entry. The cursor offset is the byte position
/// just after the line's newline and the cursor stream is the file's inode.
/// A trailing line without a newline is held back until it is completed.
pub struct FileSource {
    path: PathBuf,
    timestamp: Option<TimestampExtractor>,
    poll_interval: Duration,

    file: Option<BufReader<File>>,
    inode: u64,
    generation: u64,
    /// Position after the last complete line handed out
    offset: u64,
    partial: Vec<u8>,
}

/// Accepts `file://<path>` or a bare path.
pub fn parse_source_uri(uri: &str) -> Result<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        if path.is_empty() {
            return Err(SourceError::InvalidUri(uri.to_string()));
        }
        return Ok(PathBuf::from(path));
    }
    if uri.is_empty() || uri.contains("://") {
        return Err(SourceError::InvalidUri(uri.to_string()));
    }
    Ok(PathBuf::from(uri))
}

impl FileSource {
    pub fn new(path: PathBuf, timestamp: Option<TimestampExtractor>, poll_interval: Duration) -> Self {
        Self {
            path,
            timestamp,
            poll_interval,
            file: None,
            inode: 0,
            generation: 0,
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let path = parse_source_uri(&config.uri)?;
        let timestamp = config
            .timestamp
            .as_ref()
            .map(TimestampExtractor::from_config)
            .transpose()?;
        Ok(Self::new(path, timestamp, config.poll_interval))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cursor(&self) -> Cursor {
        Cursor::new(self.generation, self.offset).with_stream(self.inode)
    }

    /// Open the file positioned at `offset`. `Ok(false)` if it does not exist (yet).
    fn open_at(&mut self, offset: u64) -> Result<bool> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.file = None;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.inode = get_inode(&file.metadata()?);

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        self.file = Some(reader);
        self.offset = offset;
        self.partial.clear();
        Ok(true)
    }

    /// Start a fresh generation at the beginning of whatever file is at `path` now.
    fn restart_generation(&mut self) -> Result<bool> {
        self.generation += 1;
        self.file = None;
        self.offset = 0;
        self.partial.clear();
        self.open_at(0)
    }

    fn gap(&self, reason: GapReason, expected: Cursor) -> Gap {
        Gap {
            reason,
            expected: Some(expected),
            resumed_at: Some(self.cursor()),
        }
    }

    fn rotated(&self) -> Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(metadata) => Ok(get_inode(&metadata) != self.inode),
            // Mid-rotation: the new file is not there yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// At EOF with a new file at `path`: hand out what the old file still
    /// holds, then move on to the new one. `None` means read again.
    fn finish_rotated_file(&mut self) -> Result<Option<SourcePoll>> {
        // Lines may have landed in the old file after the EOF read
        let drained = match self.file.as_mut() {
            Some(old) => old.read_until(b'\n', &mut self.partial)?,
            None => 0,
        };
        if drained > 0 {
            if self.partial.ends_with(b"\n") {
                return Ok(Some(SourcePoll::Entry(self.take_line())));
            }
            return Ok(None);
        }
        if !self.partial.is_empty() {
            // The old file will never complete this line
            return Ok(Some(SourcePoll::Entry(self.take_line())));
        }

        info!(
            path = %self.path.display(),
            old_inode = self.inode,
            generation = self.generation + 1,
            "File rotated, following new file"
        );
        if !self.restart_generation()? {
            return Ok(Some(SourcePoll::Pending));
        }
        Ok(None)
    }

    fn take_line(&mut self) -> Entry {
        let raw = std::mem::take(&mut self.partial);
        self.offset += raw.len() as u64;

        let text = String::from_utf8_lossy(&raw);
        let message = text.trim_end_matches(&['\n', '\r'][..]).to_string();
        let now = Utc::now();
        let timestamp = match &self.timestamp {
            Some(extractor) => extractor.extract_or(&message, now),
            None => now,
        };

        let mut fields = HashMap::new();
        fields.insert("message".to_string(), message);
        fields.insert("path".to_string(), self.path.display().to_string());

        Entry {
            cursor: self.cursor(),
            timestamp,
            fields,
            raw_size: raw.len(),
        }
    }
}

#[async_trait]
impl LogSource for FileSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn seek(&mut self, cursor: Option<&Cursor>) -> Result<SeekOutcome> {
        let Some(cursor) = cursor else {
            self.generation = 0;
            self.open_at(0)?;
            return Ok(SeekOutcome::Exact);
        };

        self.generation = cursor.generation;
        if !self.open_at(0)? {
            return Err(SourceError::Unavailable(format!(
                "{} does not exist",
                self.path.display()
            )));
        }

        let len = self
            .file
            .as_ref()
            .map(|f| f.get_ref().metadata().map(|m| m.len()))
            .transpose()?
            .unwrap_or(0);

        let reason = if cursor.stream != 0 && cursor.stream != self.inode {
            GapReason::Rotated
        } else if len < cursor.offset {
            GapReason::Truncated
        } else {
            self.open_at(cursor.offset)?;
            return Ok(SeekOutcome::Exact);
        };

        self.restart_generation()?;
        Ok(SeekOutcome::Gap(self.gap(reason, *cursor)))
    }

    async fn next_entry(&mut self) -> Result<SourcePoll> {
        loop {
            if self.file.is_none() && !self.open_at(self.offset)? {
                return Ok(SourcePoll::Pending);
            }
            let Some(file) = self.file.as_mut() else {
                return Ok(SourcePoll::Pending);
            };

            let read = file.read_until(b'\n', &mut self.partial)?;
            if read > 0 {
                if self.partial.ends_with(b"\n") {
                    return Ok(SourcePoll::Entry(self.take_line()));
                }
                // Writer is mid-line; wait for the rest
                return Ok(SourcePoll::Pending);
            }

            let len = file.get_ref().metadata()?.len();
            if len < self.offset + self.partial.len() as u64 {
                let expected = self.cursor();
                info!(path = %self.path.display(), cursor = %expected, "File truncated");
                self.restart_generation()?;
                return Ok(SourcePoll::Gap(self.gap(GapReason::Truncated, expected)));
            }

            if self.rotated()? {
                if let Some(poll) = self.finish_rotated_file()? {
                    return Ok(poll);
                }
                continue;
            }

            return Ok(SourcePoll::Pending);
        }
    }

    async fn tail_cursor(&mut self) -> Result<Option<Cursor>> {
        let Some(file) = self.file.as_ref() else {
            return Ok((self.offset > 0 || self.generation > 0).then(|| self.cursor()));
        };
        let len = file.get_ref().metadata()?.len();
        debug!(path = %self.path.display(), len, "Snapshotted file tail");
        Ok(Some(
            Cursor::new(self.generation, len).with_stream(self.inode),
        ))
    }

    async fn wait_for_data(&mut self, timeout: Duration) -> Result<()> {
        tokio::time::sleep(self.poll_interval.min(timeout)).await;
        Ok(())
    }
}

#[cfg(unix)]
fn get_inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn get_inode(metadata: &Metadata) -> u64 {
    // No inode outside unix; size and mtime stand in for file identity
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    metadata.len().hash(&mut hasher);
    if let Ok(modified) = metadata.modified() {
        modified.hash(&mut hasher);
    }
    hasher.finish()
}
