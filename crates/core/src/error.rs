//! Error types for the rampart engine

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Flat classification of engine failures.
///
/// Callers (hardening modules, the CLI) render these into messages; the
/// engine itself never prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BackupFailure,
    RestoreFailure,
    ApplyFailure,
    ValidationFailure,
    ValidationTimeout,
    ServiceRestartFailure,
    HealthCheckFailure,
    LockTimeout,
    TargetNotFound,
    InsufficientSpace,
    /// Misuse of the engine API (illegal transition, closed session, ...)
    Usage,
    /// Session aborted by an external signal
    Aborted,
    /// Configuration, metadata, journal or plain I/O problems
    Internal,
}

/// Errors that can occur while mutating a target
#[derive(Error, Debug)]
pub enum EngineError {
    // Backup store
    #[error("Backup of target '{target}' failed: {reason}")]
    BackupFailure { target: String, reason: String },

    #[error("Restore of target '{target}' failed: {reason}")]
    RestoreFailure { target: String, reason: String },

    #[error("Not enough space in {path}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("Target '{target}' not found at {locator}")]
    TargetNotFound { target: String, locator: String },

    // Change lifecycle
    #[error("Applying change to '{target}' failed: {reason}")]
    ApplyFailure { target: String, reason: String },

    #[error("Validation of '{target}' failed: {reason}")]
    ValidationFailure { target: String, reason: String },

    #[error("Validation of '{target}' exceeded {timeout:?}")]
    ValidationTimeout { target: String, timeout: Duration },

    #[error("Reloading '{target}' failed: {reason}")]
    ServiceRestartFailure { target: String, reason: String },

    #[error("Health check of '{target}' failed: {reason}")]
    HealthCheckFailure { target: String, reason: String },

    // Locking
    #[error("Lock '{scope}' still held by pid {holder} after {waited:?}")]
    LockTimeout {
        scope: String,
        holder: u32,
        waited: Duration,
    },

    // Engine usage
    #[error("Illegal change transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Session {0} is not open")]
    SessionNotOpen(String),

    #[error("Unknown change {0}")]
    UnknownChange(String),

    #[error("No adapter registered for target kind '{0}'")]
    NoAdapter(String),

    #[error("Not permitted in a {0} session")]
    ModeViolation(String),

    #[error("Session aborted: {0}")]
    Aborted(String),

    // Plumbing
    #[error("Malformed metadata in {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl EngineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackupFailure { .. } => ErrorKind::BackupFailure,
            Self::RestoreFailure { .. } => ErrorKind::RestoreFailure,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            Self::ApplyFailure { .. } => ErrorKind::ApplyFailure,
            Self::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            Self::ValidationTimeout { .. } => ErrorKind::ValidationTimeout,
            Self::ServiceRestartFailure { .. } => ErrorKind::ServiceRestartFailure,
            Self::HealthCheckFailure { .. } => ErrorKind::HealthCheckFailure,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::IllegalTransition { .. }
            | Self::SessionNotOpen(_)
            | Self::UnknownChange(_)
            | Self::NoAdapter(_)
            | Self::ModeViolation(_) => ErrorKind::Usage,
            Self::Aborted(_) => ErrorKind::Aborted,
            Self::Metadata { .. } | Self::Config(_) | Self::Journal(_) | Self::Io { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type used throughout rampart-core
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by a [`TargetAdapter`](crate::TargetAdapter) hook.
///
/// The engine maps these onto the [`EngineError`] matching the phase in
/// which the hook ran.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("target does not exist: {0}")]
    NotFound(String),

    #[error("no space left on device: {0}")]
    NoSpace(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),
}

impl AdapterError {
    /// Build a generic failure from anything printable
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else if crate::store::is_out_of_space(&err) {
            Self::NoSpace(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

/// Result type returned by adapter hooks
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
