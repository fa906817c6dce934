//! SherlockBench client library crate
//!
//! Exposes the benchmark protocol, provider adapters and results store so
//! both binaries and the criterion benchmarks share one implementation.

pub mod bench;
pub mod config;
pub mod keyring;
pub mod llm;
pub mod printer;
pub mod report;
pub mod run;
pub mod scorer;
pub mod store;
pub mod util;
