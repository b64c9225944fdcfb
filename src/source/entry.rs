use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Position in an append-only source, pointing just past one entry.
///
/// Ordering is lexicographic over `(generation, offset, stream)`. A source
/// bumps `generation` whenever it has to restart its offsets (rotation,
/// truncation), so cursors stay monotonic across those events. `stream`
/// identifies the physical stream (for files, the inode) and only breaks ties.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cursor {
    pub generation: u64,
    pub offset: u64,
    #[serde(default)]
    pub stream: u64,
}

impl Cursor {
    pub fn new(generation: u64, offset: u64) -> Self {
        Self {
            generation,
            offset,
            stream: 0,
        }
    }

    /// Cursor in generation 0 of an unnamed stream
    pub fn at(offset: u64) -> Self {
        Self::new(0, offset)
    }

    pub fn with_stream(mut self, stream: u64) -> Self {
        self.stream = stream;
        self
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.offset)?;
        if self.stream != 0 {
            write!(f, "@{}", self.stream)?;
        }
        Ok(())
    }
}

/// One record read from the source. Never mutated after the source hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub cursor: Cursor,
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, String>,
    /// Size of the record as stored in the source, used for batch sizing
    pub raw_size: usize,
}

impl Entry {
    /// Build a plain message entry; `raw_size` is the message length.
    pub fn message(cursor: Cursor, message: impl Into<String>) -> Self {
        let message = message.into();
        let raw_size = message.len();
        let mut fields = HashMap::new();
        fields.insert("message".to_string(), message);

        Self {
            cursor,
            timestamp: Utc::now(),
            fields,
            raw_size,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}
