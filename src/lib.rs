//! Shared fixtures for the workspace integration tests and benches.

pub mod bench_support;

pub use quota_core;
