pub mod checkpoint;
pub mod memory;
pub mod traits;

pub use checkpoint::FileCursorStore;
pub use memory::MemoryCursorStore;
pub use traits::{CursorStore, CursorStoreError};
