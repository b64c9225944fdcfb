pub mod server;

pub use server::{create_router, run_status_server};
