pub mod entry;
pub mod file;
pub mod memory;
pub mod reader;
pub mod timestamp;
pub mod traits;

pub use entry::{Cursor, Entry};
pub use file::FileSource;
pub use memory::{MemoryLogHandle, MemorySource};
pub use reader::{ReadEvent, ReadMode, ReaderError, ReaderSettings, SourceReader};
pub use traits::{Gap, GapReason, LogSource, SeekOutcome, SourceError, SourcePoll};

use crate::config::types::SourceConfig;

/// Build the source named by `config.uri`.
pub fn source_from_config(config: &SourceConfig) -> Result<Box<dyn LogSource>, SourceError> {
    Ok(Box::new(FileSource::from_config(config)?))
}
