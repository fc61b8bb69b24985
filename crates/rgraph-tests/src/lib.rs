//! rgraph test & validation infrastructure
//!
//! An in-memory resource graph server with optimistic-concurrency commits,
//! a harness that wires clients to it, and the end-to-end, concurrency and
//! property-based suites run against the real client stack.

pub mod harness;
pub mod server;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod proptest_client;

pub use harness::{init_tracing, issue_token, test_config, TestEnv};
pub use server::{MemoryGraphServer, ServerStats};
