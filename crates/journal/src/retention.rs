//! Retention policy and backup garbage collection

use crate::journal::Journal;
use rampart_core::{BackupStore, CleanupReport, EngineConfig, Result};
use std::time::Duration;

/// Retention policy configuration
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Backups older than this many days are collectable (default: 30)
    pub retention_days: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retention_days: config.retention.retention_days,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.retention_days * 86_400)
    }
}

/// Garbage collector
pub struct GarbageCollector {
    policy: RetentionPolicy,
}

impl GarbageCollector {
    /// Create a new GC with the given policy
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Purge expired backups.
    ///
    /// Anything belonging to a session the journal still lists as open or
    /// failed is kept regardless of age.
    pub fn collect(&self, store: &BackupStore, journal: &Journal) -> Result<CleanupReport> {
        let protected = journal.protected()?;
        tracing::debug!(
            sessions = protected.sessions.len(),
            records = protected.records.len(),
            "Protected from retention"
        );
        let report = store.cleanup(self.policy.max_age(), &protected)?;
        tracing::info!(
            records_deleted = report.records_deleted,
            records_protected = report.records_protected,
            orphans_deleted = report.orphans_deleted,
            bytes_freed = report.bytes_freed,
            "Retention pass complete"
        );
        Ok(report)
    }
}
