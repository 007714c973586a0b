//! Sessions: one hardening run, rolled back as a unit

use crate::change::{Change, ChangeId, ChangeState};
use rampart_core::{EngineError, LockHandle, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use ulid::Ulid;

pub type SessionId = Ulid;

/// How confirmations and writes are handled. Fixed per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A confirmation gate approves each change before it is applied
    Interactive,
    /// The configured default decision stands in for confirmation
    NonInteractive,
    /// Stage and validate against scratch copies; nothing is written
    DryRun,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::NonInteractive => "non_interactive",
            Self::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "interactive" => Ok(Self::Interactive),
            "non_interactive" => Ok(Self::NonInteractive),
            "dry_run" => Ok(Self::DryRun),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Committed,
    RolledBack,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    /// Sessions whose backups retention must keep
    pub fn holds_backups(&self) -> bool {
        matches!(self, Self::Open | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live session. Owns its changes and the host lock.
#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) started_at_ms: u64,
    pub(crate) mode: ExecutionMode,
    pub(crate) status: SessionStatus,
    pub(crate) changes: Vec<Change>,
    pub(crate) backup_dir: PathBuf,
    pub(crate) lock: Option<LockHandle>,
    pub(crate) next_apply_seq: u32,
    pub(crate) closed_at_ms: Option<u64>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        started_at_ms: u64,
        mode: ExecutionMode,
        backup_dir: PathBuf,
        lock: LockHandle,
    ) -> Self {
        Self {
            id,
            started_at_ms,
            mode,
            status: SessionStatus::Open,
            changes: Vec::new(),
            backup_dir,
            lock: Some(lock),
            next_apply_seq: 0,
            closed_at_ms: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at_ms.is_some()
    }

    /// Changes in proposal order
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn change(&self, id: ChangeId) -> Option<&Change> {
        self.changes.iter().find(|c| c.id == id)
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(|l| l.is_held())
    }

    pub(crate) fn require_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(EngineError::SessionNotOpen(self.id.to_string()))
        }
    }

    pub(crate) fn index_of(&self, id: ChangeId) -> Result<usize> {
        self.changes
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| EngineError::UnknownChange(id.to_string()))
    }

    pub(crate) fn take_apply_seq(&mut self) -> u32 {
        let seq = self.next_apply_seq;
        self.next_apply_seq += 1;
        seq
    }

    /// Indices of changes needing session rollback, latest applied first.
    /// Changes that never reached a write follow in reverse proposal order.
    pub(crate) fn rollback_order(&self) -> Vec<usize> {
        let mut applied: Vec<(u32, usize)> = Vec::new();
        let mut unapplied: Vec<usize> = Vec::new();
        for (idx, change) in self.changes.iter().enumerate() {
            if matches!(change.state, ChangeState::Pending | ChangeState::RolledBack) {
                continue;
            }
            match change.apply_seq {
                Some(seq) => applied.push((seq, idx)),
                None => unapplied.push(idx),
            }
        }
        applied.sort_by(|a, b| b.0.cmp(&a.0));
        applied
            .into_iter()
            .map(|(_, idx)| idx)
            .chain(unapplied.into_iter().rev())
            .collect()
    }

    /// Journal view of this session
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id,
            started_at_ms: self.started_at_ms,
            mode: self.mode,
            status: self.status,
            closed_at_ms: self.closed_at_ms,
            backup_dir: self.backup_dir.clone(),
            change_ids: self.changes.iter().map(|c| c.id).collect(),
            lock_scope: self.lock.as_ref().map(|l| l.scope().to_string()),
        }
    }
}

/// Durable summary of a session, as stored in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub started_at_ms: u64,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub closed_at_ms: Option<u64>,
    pub backup_dir: PathBuf,
    pub change_ids: Vec<ChangeId>,
    pub lock_scope: Option<String>,
}

impl SessionRecord {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| EngineError::Journal(format!("encoding session: {e}")))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| EngineError::Journal(format!("decoding session: {e}")))
    }
}
