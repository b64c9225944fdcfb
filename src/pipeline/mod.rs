pub mod backpressure;
pub mod batch;
pub mod batcher;
pub mod channel;

pub use backpressure::OutstandingLimiter;
pub use batch::{Batch, DeliveryState};
pub use batcher::{run_batcher, BatchLimits, Batcher, PendingBatch, PipelineError};
pub use channel::{create_channel, Receiver, Sender};
