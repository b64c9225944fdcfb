pub mod committer;
pub mod error;
pub mod runner;
pub mod state;

pub use committer::{run_committer, Committer};
pub use error::EngineError;
pub use runner::{EngineHandle, EngineReport, EngineSettings, TailEngine};
pub use state::{EngineState, EngineStatus, ErrorKind, Fault, StatusPublisher};
