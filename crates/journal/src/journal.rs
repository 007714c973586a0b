//! Durable audit journal of sessions and changes using sled

use crate::change::{Change, ChangeId};
use crate::session::{SessionId, SessionRecord, SessionStatus};
use parking_lot::RwLock;
use rampart_core::{EngineError, ProtectedSet, Result};
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};
use ulid::Ulid;

const BUSY_POLL: Duration = Duration::from_millis(100);

/// Audit journal for sessions and their changes.
///
/// Keys are ULID bytes, so iteration order is creation order. Changes are
/// never purged with their session.
pub struct Journal {
    /// Sled database
    db: Db,
    sessions: Tree,
    changes: Tree,
    /// In-memory index: session_id -> status
    index: RwLock<BTreeMap<SessionId, SessionStatus>>,
}

fn db_err(e: sled::Error) -> EngineError {
    EngineError::Journal(e.to_string())
}

/// sled reports a held database lock as a plain I/O error
fn is_busy(e: &sled::Error) -> bool {
    matches!(e, sled::Error::Io(io) if io.to_string().contains("could not acquire lock"))
}

fn key(id: Ulid) -> [u8; 16] {
    id.to_bytes()
}

impl Journal {
    /// Open or create a journal in the given directory
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_wait(path, Duration::ZERO)
    }

    /// Open the journal, waiting up to `timeout` while another process
    /// has it open. sled holds an exclusive file lock for as long as a
    /// `Db` is alive.
    pub fn open_wait(path: &Path, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| EngineError::io(path, e))?;
        let db_path = path.join("journal.db");
        let started = Instant::now();
        let db = loop {
            match sled::open(&db_path) {
                Ok(db) => break db,
                Err(e) if is_busy(&e) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(EngineError::Journal(format!(
                            "journal {} is in use by another rampart process (waited {:?})",
                            db_path.display(),
                            waited
                        )));
                    }
                    tracing::debug!("Journal busy, retrying");
                    sleep(BUSY_POLL.min(timeout - waited));
                }
                Err(e) => return Err(db_err(e)),
            }
        };
        let sessions = db.open_tree("sessions").map_err(db_err)?;
        let changes = db.open_tree("changes").map_err(db_err)?;

        // Build in-memory index on startup
        let mut index = BTreeMap::new();
        for item in sessions.iter() {
            let (_, value) = item.map_err(db_err)?;
            let record = SessionRecord::deserialize(&value)?;
            index.insert(record.id, record.status);
        }

        Ok(Self {
            db,
            sessions,
            changes,
            index: RwLock::new(index),
        })
    }

    /// Insert or replace a session record
    pub fn record_session(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .insert(key(record.id), record.serialize()?)
            .map_err(db_err)?;
        self.index.write().insert(record.id, record.status);
        self.flush()
    }

    /// Insert or replace a change record
    pub fn record_change(&self, change: &Change) -> Result<()> {
        self.changes
            .insert(key(change.id), change.serialize()?)
            .map_err(db_err)?;
        self.flush()
    }

    pub fn session(&self, id: SessionId) -> Result<Option<SessionRecord>> {
        match self.sessions.get(key(id)).map_err(db_err)? {
            Some(value) => Ok(Some(SessionRecord::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn change(&self, id: ChangeId) -> Result<Option<Change>> {
        match self.changes.get(key(id)).map_err(db_err)? {
            Some(value) => Ok(Some(Change::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All sessions, newest first
    pub fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for item in self.sessions.iter().rev() {
            let (_, value) = item.map_err(db_err)?;
            records.push(SessionRecord::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Changes of a session in proposal order
    pub fn changes_for(&self, session: &SessionRecord) -> Result<Vec<Change>> {
        let mut changes = Vec::with_capacity(session.change_ids.len());
        for id in &session.change_ids {
            match self.change(*id)? {
                Some(change) => changes.push(change),
                None => tracing::warn!(session = %session.id, change = %id, "Change missing from journal"),
            }
        }
        Ok(changes)
    }

    /// Resolve a full session id or a unique prefix of one
    pub fn resolve_session(&self, reference: &str) -> Result<Option<SessionId>> {
        if let Ok(id) = Ulid::from_string(reference) {
            return Ok(self.index.read().contains_key(&id).then_some(id));
        }
        let reference = reference.to_ascii_uppercase();
        let index = self.index.read();
        let mut matching = index.keys().filter(|id| id.to_string().starts_with(&reference));
        match (matching.next(), matching.next()) {
            (Some(id), None) => Ok(Some(*id)),
            (None, _) => Ok(None),
            (Some(_), Some(_)) => Err(EngineError::Journal(format!(
                "ambiguous session prefix '{reference}'"
            ))),
        }
    }

    /// Sessions and backup records retention must keep: everything
    /// belonging to sessions that are still open or ended in failure
    pub fn protected(&self) -> Result<ProtectedSet> {
        let held: Vec<SessionId> = self
            .index
            .read()
            .iter()
            .filter(|(_, status)| status.holds_backups())
            .map(|(id, _)| *id)
            .collect();

        let mut protected = ProtectedSet::default();
        for id in held {
            protected.sessions.insert(id);
            let Some(record) = self.session(id)? else {
                continue;
            };
            for change in self.changes_for(&record)? {
                if let Some(record_id) = change.backup_record_id {
                    protected.records.insert(record_id);
                }
            }
        }
        Ok(protected)
    }

    /// Get the total number of sessions
    pub fn count(&self) -> usize {
        self.index.read().len()
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ExecutionMode;
    use rampart_core::{Criticality, Target, TargetKind};
    use std::path::PathBuf;

    fn record(status: SessionStatus, change_ids: Vec<ChangeId>) -> SessionRecord {
        SessionRecord {
            id: Ulid::new(),
            started_at_ms: 1,
            mode: ExecutionMode::NonInteractive,
            status,
            closed_at_ms: None,
            backup_dir: PathBuf::from("/var/backups/rampart/sessions/x"),
            change_ids,
            lock_scope: Some("host".into()),
        }
    }

    fn change_with_backup(session_id: SessionId) -> Change {
        let target = Target::new("jail.local", TargetKind::File, "/etc/fail2ban/jail.local", Criticality::Advisory);
        let mut change = Change::new(session_id, target, b"[sshd]\n".to_vec(), 1);
        change.backup_record_id = Some(Ulid::new());
        change
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let session = record(SessionStatus::Committed, vec![]);
        {
            let journal = Journal::open(temp_dir.path()).unwrap();
            journal.record_session(&session).unwrap();
        }

        let journal = Journal::open(temp_dir.path()).unwrap();
        assert_eq!(journal.count(), 1);
        assert_eq!(journal.session(session.id).unwrap(), Some(session));
    }

    #[test]
    fn test_sessions_newest_first() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp_dir.path()).unwrap();

        let first = record(SessionStatus::Committed, vec![]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = record(SessionStatus::Failed, vec![]);
        journal.record_session(&first).unwrap();
        journal.record_session(&second).unwrap();

        let ids: Vec<_> = journal.sessions().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn test_protected_follows_status() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp_dir.path()).unwrap();

        let mut open = record(SessionStatus::Open, vec![]);
        let open_change = change_with_backup(open.id);
        open.change_ids.push(open_change.id);

        let mut done = record(SessionStatus::Committed, vec![]);
        let done_change = change_with_backup(done.id);
        done.change_ids.push(done_change.id);

        for change in [&open_change, &done_change] {
            journal.record_change(change).unwrap();
        }
        journal.record_session(&open).unwrap();
        journal.record_session(&done).unwrap();

        let protected = journal.protected().unwrap();
        assert!(protected.sessions.contains(&open.id));
        assert!(!protected.sessions.contains(&done.id));
        assert!(protected.records.contains(&open_change.backup_record_id.unwrap()));
        assert!(!protected.records.contains(&done_change.backup_record_id.unwrap()));

        // Once the open session commits, its backups become collectable
        open.status = SessionStatus::Committed;
        journal.record_session(&open).unwrap();
        assert!(journal.protected().unwrap().sessions.is_empty());
    }

    #[test]
    fn test_open_waits_for_other_holder() {
        let temp_dir = tempfile::tempdir().unwrap();
        let first = Journal::open(temp_dir.path()).unwrap();

        match Journal::open_wait(temp_dir.path(), Duration::from_millis(200)) {
            Err(EngineError::Journal(msg)) => assert!(msg.contains("in use")),
            other => panic!("expected busy journal, got {:?}", other.map(|_| ())),
        }

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(first);
        });
        let second = Journal::open_wait(temp_dir.path(), Duration::from_secs(10)).unwrap();
        releaser.join().unwrap();
        assert_eq!(second.count(), 0);
    }

    #[test]
    fn test_resolve_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(temp_dir.path()).unwrap();
        let session = record(SessionStatus::Committed, vec![]);
        journal.record_session(&session).unwrap();

        let full = session.id.to_string();
        assert_eq!(journal.resolve_session(&full).unwrap(), Some(session.id));
        assert_eq!(journal.resolve_session(&full[..20].to_lowercase()).unwrap(), Some(session.id));
        assert_eq!(journal.resolve_session("ZZZZ").unwrap(), None);
    }
}
