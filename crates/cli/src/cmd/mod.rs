//! CLI command implementations

pub mod apply;
pub mod cleanup;
pub mod config;
pub mod lock;
pub mod restore_point;
pub mod sessions;
