//! Change data structures and the state machine they move through

use rampart_core::{EngineError, Result, Target};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use ulid::Ulid;

pub type ChangeId = Ulid;

/// Lifecycle state of a [`Change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Pending,
    BackedUp,
    Applied,
    Validated,
    Committed,
    Failed,
    RolledBack,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::BackedUp => "backed_up",
            Self::Applied => "applied",
            Self::Validated => "validated",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Forward along pending→backed_up→applied→validated→committed, or
    /// divert through failed→rolled_back. Nothing else.
    pub fn can_become(self, next: ChangeState) -> bool {
        use ChangeState::*;
        matches!(
            (self, next),
            (Pending, BackedUp)
                | (BackedUp, Applied)
                | (Applied, Validated)
                | (Validated, Committed)
                | (Pending | BackedUp | Applied | Validated | Committed, Failed)
                | (Failed, RolledBack)
        )
    }

    /// No further transitions expected during a session
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single proposed mutation of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub session_id: Ulid,
    pub target: Target,
    /// Full new content (file bytes or serialized state)
    pub proposed: Vec<u8>,
    pub state: ChangeState,
    /// Snapshot taken by `stage`
    pub backup_record_id: Option<Ulid>,
    /// `.meta` of that snapshot, reloaded (and checksum-verified) on rollback
    pub backup_meta: Option<PathBuf>,
    pub proposed_at_ms: u64,
    /// Set the moment the adapter's write is attempted
    pub applied_at_ms: Option<u64>,
    /// Position in application order within the session
    pub apply_seq: Option<u32>,
    /// A reload was issued for this change
    pub reloaded: bool,
    /// Rolled back by the failure policy or a declined confirmation rather
    /// than by a session abort
    pub settled_by_policy: bool,
    pub last_error: Option<String>,
    pub updated_at_ms: u64,
}

impl Change {
    pub fn new(session_id: Ulid, target: Target, proposed: Vec<u8>, now_ms: u64) -> Self {
        Self {
            id: Ulid::new(),
            session_id,
            target,
            proposed,
            state: ChangeState::Pending,
            backup_record_id: None,
            backup_meta: None,
            proposed_at_ms: now_ms,
            applied_at_ms: None,
            apply_seq: None,
            reloaded: false,
            settled_by_policy: false,
            last_error: None,
            updated_at_ms: now_ms,
        }
    }

    /// Move to `next`, rejecting anything the state machine forbids
    pub fn advance(&mut self, next: ChangeState, now_ms: u64) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(EngineError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        // A change may only count as applied once its snapshot is recorded
        if next == ChangeState::Applied && self.backup_record_id.is_none() {
            return Err(EngineError::IllegalTransition {
                from: self.state.to_string(),
                to: format!("{next} (no backup recorded)"),
            });
        }
        tracing::debug!(change = %self.id, target_id = %self.target.id, "{} -> {}", self.state, next);
        self.state = next;
        self.updated_at_ms = now_ms;
        Ok(())
    }

    /// Whether the target may differ from its snapshot
    pub fn write_attempted(&self) -> bool {
        self.applied_at_ms.is_some()
    }

    /// Serialize for the journal
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineError::Journal(format!("encoding change: {e}")))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| EngineError::Journal(format!("decoding change: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{Criticality, TargetKind};

    fn change() -> Change {
        let target = Target::new(
            "sshd_config",
            TargetKind::File,
            "/etc/ssh/sshd_config",
            Criticality::Critical,
        );
        Change::new(Ulid::new(), target, b"Port 2222\n".to_vec(), 1)
    }

    #[test]
    fn test_happy_path() {
        let mut c = change();
        c.advance(ChangeState::BackedUp, 2).unwrap();
        c.backup_record_id = Some(Ulid::new());
        c.advance(ChangeState::Applied, 3).unwrap();
        c.advance(ChangeState::Validated, 4).unwrap();
        c.advance(ChangeState::Committed, 5).unwrap();
        assert!(c.state.is_final());
        assert_eq!(c.updated_at_ms, 5);
    }

    #[test]
    fn test_no_skipping_validation() {
        let mut c = change();
        c.advance(ChangeState::BackedUp, 2).unwrap();
        c.backup_record_id = Some(Ulid::new());
        c.advance(ChangeState::Applied, 3).unwrap();

        let err = c.advance(ChangeState::Committed, 4).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
        assert_eq!(c.state, ChangeState::Applied);
    }

    #[test]
    fn test_applied_requires_backup() {
        let mut c = change();
        c.advance(ChangeState::BackedUp, 2).unwrap();
        assert!(c.advance(ChangeState::Applied, 3).is_err());
    }

    #[test]
    fn test_rollback_only_through_failed() {
        use ChangeState::*;
        assert!(!Applied.can_become(RolledBack));
        assert!(Committed.can_become(Failed));
        assert!(Failed.can_become(RolledBack));
        assert!(!RolledBack.can_become(Pending));
        assert!(!RolledBack.can_become(Failed));
        assert!(!Failed.can_become(Committed));
    }

    #[test]
    fn test_journal_encoding() {
        let mut c = change();
        c.last_error = Some("sshd -t: line 3: Bad configuration option".into());
        let decoded = Change::deserialize(&c.serialize().unwrap()).unwrap();
        assert_eq!(decoded, c);
    }
}
