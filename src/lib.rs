pub mod backoff;
pub mod cli;
pub mod config;
pub mod engine;
pub mod forwarder;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod web;
