//! Core primitives for transactional configuration changes
//!
//! This crate provides:
//! - BLAKE3 checksums and stable reads
//! - Target descriptors and the adapter contract hardening modules implement
//! - Timestamped backup store with atomic writes
//! - `KEY=value` metadata serializer shared with older tooling
//! - Host-level lock files
//! - Engine configuration and error kinds

pub mod config;
pub mod error;
pub mod hash;
pub mod kvmeta;
pub mod lock;
pub mod store;
pub mod target;
pub mod time;

// Re-exports
pub use config::{Decision, EngineConfig};
pub use error::{AdapterError, AdapterResult, EngineError, ErrorKind, Result};
pub use hash::{hash_bytes, hash_file, Blake3Hash};
pub use kvmeta::{KvDocument, KvSchema};
pub use lock::{LockHandle, LockHolder, LockManager, LockState};
pub use store::{atomic_write, BackupRecord, BackupStore, CleanupReport, ProtectedSet};
pub use target::{
    AdapterRegistry, Criticality, ReloadOutcome, Target, TargetAdapter, TargetKind,
    ValidationSubject,
};
