//! AMY telemetry ingest — library crate for the core service.
//!
//! Re-exports all modules so the binary (`main.rs`) and the e2e test
//! crate can access internal types like `Pipeline`, `MemoryStore`, and
//! `MemoryEventSink`.

pub mod audit;
pub mod config;
pub mod dataflow;
pub mod emergency;
pub mod listener;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod writer;
