//! AMY data-flow monitor — library crate for the collector service.
//!
//! Re-exports all modules so the binary (`main.rs`) and the e2e test
//! crate can access `EventHub`, `build_router`, and friends.

pub mod config;
pub mod error;
pub mod ring;
pub mod routes;
pub mod state;
