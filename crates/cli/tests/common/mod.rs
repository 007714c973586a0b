//! Common utilities for integration tests

pub mod cli;
pub mod host;

// Re-export commonly used items
pub use host::TestHost;
