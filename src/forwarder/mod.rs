pub mod delivery;
pub mod file;
pub mod http;
pub mod sink;
#[cfg(unix)]
pub mod unix;

pub use delivery::{
    run_forwarder, Completion, DeliveryCounts, DeliveryOutcome, DeliverySettings, DeliveryTracker,
    Forwarder,
};
pub use file::FileSink;
pub use http::HttpSink;
pub use sink::{sink_from_config, BatchEnvelope, Sink, SinkError, SinkResponse};
#[cfg(unix)]
pub use unix::UnixSink;
