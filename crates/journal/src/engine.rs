//! Session manager: drives changes through backup, apply, validate and
//! commit, and undoes them when they fail

use crate::change::{Change, ChangeId, ChangeState};
use crate::journal::Journal;
use crate::policy::{
    run_hook, unified_diff, AbortSignal, ConfirmationGate, ConfirmationRequest, DryRunOutcome,
    FailureAction, FixedDecision,
};
use crate::session::{ExecutionMode, Session, SessionId, SessionStatus};
use parking_lot::Mutex;
use rampart_core::time::now_ms;
use rampart_core::{
    AdapterError, AdapterRegistry, BackupRecord, BackupStore, Criticality, Decision, EngineConfig,
    EngineError, LockHandle, ReloadOutcome, Result, Target, TargetKind, ValidationSubject,
};
use serde::Serialize;
use std::time::Duration;

/// Timeouts and defaults the manager runs with
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub hook_timeout: Duration,
    pub health_timeout: Duration,
    /// Stands in for confirmation in non-interactive sessions
    pub default_decision: Decision,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            hook_timeout: config.hook_timeout(),
            health_timeout: config.health_timeout(),
            default_decision: config.session.default_decision,
        }
    }
}

/// Result of [`SessionManager::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Confirmation was refused; the target was never touched
    Declined,
}

/// One entry of a plan handed to [`SessionManager::execute`]
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub target: Target,
    pub proposed: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeSummary {
    pub change_id: ChangeId,
    pub target_id: String,
    pub kind: TargetKind,
    pub criticality: Criticality,
    pub state: ChangeState,
    pub error: Option<String>,
}

/// What a session did, for display
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub changes: Vec<ChangeSummary>,
    pub dry_run: Vec<DryRunOutcome>,
    pub warnings: Vec<String>,
}

impl SessionReport {
    pub fn new(session: &Session, dry_run: Vec<DryRunOutcome>, warnings: Vec<String>) -> Self {
        Self {
            session_id: session.id(),
            mode: session.mode(),
            status: session.status(),
            changes: session
                .changes()
                .iter()
                .map(|c| ChangeSummary {
                    change_id: c.id,
                    target_id: c.target.id.clone(),
                    kind: c.target.kind,
                    criticality: c.target.criticality,
                    state: c.state,
                    error: c.last_error.clone(),
                })
                .collect(),
            dry_run,
            warnings,
        }
    }
}

/// Owns the backup store, adapters and journal; every operation takes the
/// session it acts on explicitly.
pub struct SessionManager {
    store: BackupStore,
    adapters: AdapterRegistry,
    journal: Journal,
    settings: EngineSettings,
    gate: Mutex<Box<dyn ConfirmationGate>>,
    abort: AbortSignal,
}

impl SessionManager {
    pub fn new(
        store: BackupStore,
        adapters: AdapterRegistry,
        journal: Journal,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            adapters,
            journal,
            settings,
            // Nobody to ask: interactive sessions decline until a gate is set
            gate: Mutex::new(Box::new(FixedDecision(Decision::Decline))),
            abort: AbortSignal::new(),
        }
    }

    /// Gate consulted before each write in interactive sessions
    pub fn with_gate(mut self, gate: Box<dyn ConfirmationGate>) -> Self {
        self.gate = Mutex::new(gate);
        self
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start a session under a held host lock
    pub fn open(&self, mode: ExecutionMode, lock: LockHandle) -> Result<Session> {
        if !lock.is_held() {
            return Err(EngineError::Config(format!(
                "lock '{}' was already released",
                lock.scope()
            )));
        }
        let id = SessionId::new();
        let started_at_ms = now_ms();
        let backup_dir = self.store.create_session_dir(id, started_at_ms)?;
        let session = Session::new(id, started_at_ms, mode, backup_dir, lock);
        self.journal.record_session(&session.record())?;
        tracing::info!(session = %id, %mode, "Opened session");
        Ok(session)
    }

    /// Open a session wrapped in a guard that rolls it back if dropped open
    pub fn open_guarded(&self, mode: ExecutionMode, lock: LockHandle) -> Result<SessionGuard<'_>> {
        Ok(SessionGuard {
            manager: self,
            session: self.open(mode, lock)?,
        })
    }

    /// Register a proposed mutation of `target`
    pub fn propose(&self, session: &mut Session, target: Target, proposed: Vec<u8>) -> Result<ChangeId> {
        session.require_open()?;
        target.check_id()?;
        self.adapters.for_target(&target)?;

        let change = Change::new(session.id, target, proposed, now_ms());
        let id = change.id;
        tracing::info!(session = %session.id, change = %id, target_id = %change.target.id, "Proposed change");
        self.journal_change(&change);
        session.changes.push(change);
        self.journal_session(session);
        Ok(id)
    }

    /// Snapshot the target before anything is written
    pub fn stage(&self, session: &mut Session, id: ChangeId) -> Result<()> {
        session.require_open()?;
        let idx = session.index_of(id)?;
        expect_state(&session.changes[idx], ChangeState::Pending)?;

        let target = session.changes[idx].target.clone();
        let adapter = self.adapters.for_target(&target)?;
        match self
            .store
            .backup(session.id, session.started_at_ms, &target, adapter)
        {
            Ok(record) => {
                let change = &mut session.changes[idx];
                change.backup_record_id = Some(record.id);
                change.backup_meta = Some(record.meta_path());
                change.advance(ChangeState::BackedUp, now_ms())?;
                tracing::info!(change = %id, target_id = %target.id, record = %record.id, "Backed up");
                self.journal_change(&session.changes[idx]);
                Ok(())
            }
            Err(err) => Err(self.handle_failure(session, idx, err)),
        }
    }

    /// Confirm, then write the proposed content
    pub fn apply(&self, session: &mut Session, id: ChangeId) -> Result<ApplyOutcome> {
        session.require_open()?;
        self.require_live_mode(session, "apply")?;
        let idx = session.index_of(id)?;
        expect_state(&session.changes[idx], ChangeState::BackedUp)?;

        let decision = match session.mode {
            ExecutionMode::Interactive => {
                let change = &session.changes[idx];
                let current = self.backup_content(change).unwrap_or_else(|e| {
                    tracing::warn!("Could not read snapshot for diff: {}", e);
                    Vec::new()
                });
                let diff = unified_diff(&change.target.locator, &current, &change.proposed);
                let request = ConfirmationRequest {
                    change_id: id,
                    target: &change.target,
                    diff: &diff,
                };
                self.gate.lock().confirm(&request)
            }
            _ => self.settings.default_decision,
        };

        if decision == Decision::Decline {
            let change = &mut session.changes[idx];
            change.last_error = Some("declined".to_string());
            change.settled_by_policy = true;
            change.advance(ChangeState::Failed, now_ms())?;
            change.advance(ChangeState::RolledBack, now_ms())?;
            tracing::info!(change = %id, target_id = %change.target.id, "Change declined, target untouched");
            self.journal_change(&session.changes[idx]);
            return Ok(ApplyOutcome::Declined);
        }

        let seq = session.take_apply_seq();
        let target = session.changes[idx].target.clone();
        let adapter = self.adapters.for_target(&target)?;
        {
            let change = &mut session.changes[idx];
            change.applied_at_ms = Some(now_ms());
            change.apply_seq = Some(seq);
        }
        // Journal the intent before touching the target
        self.journal_change(&session.changes[idx]);

        let proposed = &session.changes[idx].proposed;
        let written = run_hook(self.settings.hook_timeout, |_| adapter.write(&target, proposed));
        match written {
            Ok(()) => {
                session.changes[idx].advance(ChangeState::Applied, now_ms())?;
                tracing::info!(change = %id, target_id = %target.id, "Applied");
                self.journal_change(&session.changes[idx]);
                Ok(ApplyOutcome::Applied)
            }
            Err(AdapterError::NoSpace(reason)) => {
                tracing::debug!("write failed: {}", reason);
                let err = EngineError::InsufficientSpace {
                    path: target.locator.clone().into(),
                    needed: session.changes[idx].proposed.len() as u64,
                    available: 0,
                };
                Err(self.handle_failure(session, idx, err))
            }
            Err(e) => {
                let err = EngineError::ApplyFailure {
                    target: target.id.clone(),
                    reason: e.to_string(),
                };
                Err(self.handle_failure(session, idx, err))
            }
        }
    }

    /// Run the validation hook against the live target
    pub fn validate(&self, session: &mut Session, id: ChangeId) -> Result<()> {
        session.require_open()?;
        self.require_live_mode(session, "validate")?;
        let idx = session.index_of(id)?;
        expect_state(&session.changes[idx], ChangeState::Applied)?;

        let target = session.changes[idx].target.clone();
        let adapter = self.adapters.for_target(&target)?;
        let checked = run_hook(self.settings.hook_timeout, |budget| {
            adapter.validate(&target, ValidationSubject::Live, budget)
        });
        match checked {
            Ok(()) => {
                session.changes[idx].advance(ChangeState::Validated, now_ms())?;
                tracing::info!(change = %id, target_id = %target.id, "Validated");
                self.journal_change(&session.changes[idx]);
                Ok(())
            }
            Err(e) => Err(self.handle_failure(session, idx, validation_error(&target, e))),
        }
    }

    /// Reload the service if there is one, confirm it is healthy, commit
    pub fn commit(&self, session: &mut Session, id: ChangeId) -> Result<()> {
        session.require_open()?;
        self.require_live_mode(session, "commit")?;
        let idx = session.index_of(id)?;
        expect_state(&session.changes[idx], ChangeState::Validated)?;

        let target = session.changes[idx].target.clone();
        let adapter = self.adapters.for_target(&target)?;

        session.changes[idx].reloaded = true;
        let reloaded = run_hook(self.settings.hook_timeout, |budget| adapter.reload(&target, budget));
        match reloaded {
            Ok(ReloadOutcome::Reloaded) => {
                let healthy = run_hook(self.settings.health_timeout, |budget| {
                    adapter.health_check(&target, budget)
                });
                if let Err(e) = healthy {
                    let err = EngineError::HealthCheckFailure {
                        target: target.id.clone(),
                        reason: e.to_string(),
                    };
                    return Err(self.handle_failure(session, idx, err));
                }
            }
            Ok(ReloadOutcome::NotApplicable) => session.changes[idx].reloaded = false,
            Err(e) => {
                let err = EngineError::ServiceRestartFailure {
                    target: target.id.clone(),
                    reason: e.to_string(),
                };
                return Err(self.handle_failure(session, idx, err));
            }
        }

        session.changes[idx].advance(ChangeState::Committed, now_ms())?;
        tracing::info!(change = %id, target_id = %target.id, "Committed");
        self.journal_change(&session.changes[idx]);
        Ok(())
    }

    /// Stage-only counterpart of apply/validate for dry-run sessions.
    ///
    /// Writes the proposed content to a scratch file next to the backups
    /// and validates that instead of the live target.
    pub fn dry_run(&self, session: &mut Session, id: ChangeId) -> Result<DryRunOutcome> {
        session.require_open()?;
        if session.mode != ExecutionMode::DryRun {
            return Err(EngineError::ModeViolation(format!("{} (dry_run)", session.mode)));
        }
        let idx = session.index_of(id)?;
        expect_state(&session.changes[idx], ChangeState::BackedUp)?;

        let change = &session.changes[idx];
        let target = change.target.clone();
        let adapter = self.adapters.for_target(&target)?;
        let current = self.backup_content(change)?;
        let diff = unified_diff(&target.locator, &current, &change.proposed);

        let scratch = session.backup_dir.join(format!(".{}.proposed", target.id));
        std::fs::write(&scratch, &change.proposed).map_err(|e| EngineError::io(&scratch, e))?;
        let checked = run_hook(self.settings.hook_timeout, |budget| {
            adapter.validate(&target, ValidationSubject::Scratch(&scratch), budget)
        });
        if let Err(e) = std::fs::remove_file(&scratch) {
            tracing::debug!("Failed to remove {}: {}", scratch.display(), e);
        }

        let validation_error = checked.err().map(|e| validation_error(&target, e).to_string());
        if let Some(reason) = &validation_error {
            tracing::warn!(target_id = %target.id, "Dry run: {}", reason);
        }
        session.changes[idx].last_error = validation_error.clone();
        self.journal_change(&session.changes[idx]);

        Ok(DryRunOutcome {
            change_id: id,
            target_id: target.id,
            diff,
            validation_error,
        })
    }

    /// Restore one change from its backup
    pub fn rollback(&self, session: &mut Session, id: ChangeId) -> Result<()> {
        session.require_open()?;
        let idx = session.index_of(id)?;
        self.rollback_change(session, idx)
    }

    /// Undo every change that got past `pending`, latest applied first.
    ///
    /// Keeps going past individual restore failures; the session ends
    /// `failed` instead of `rolled_back` if any occurred.
    pub fn rollback_session(&self, session: &mut Session) -> Result<()> {
        session.require_open()?;
        tracing::info!(session = %session.id, "Rolling back session");

        let mut failures: Vec<(String, EngineError)> = Vec::new();
        for idx in session.rollback_order() {
            if let Err(e) = self.rollback_change(session, idx) {
                failures.push((session.changes[idx].target.id.clone(), e));
            }
        }

        if failures.is_empty() {
            session.status = SessionStatus::RolledBack;
            self.journal_session(session);
            return Ok(());
        }

        session.status = SessionStatus::Failed;
        self.journal_session(session);
        for (target, e) in &failures {
            tracing::error!(session = %session.id, target_id = %target, "Restore failed: {}", e);
        }
        let targets: Vec<&str> = failures.iter().map(|(t, _)| t.as_str()).collect();
        let reasons: Vec<String> = failures.iter().map(|(_, e)| e.to_string()).collect();
        Err(EngineError::RestoreFailure {
            target: targets.join(", "),
            reason: reasons.join("; "),
        })
    }

    /// Settle the session's final status, release its lock and journal it.
    ///
    /// Changes still in flight are rolled back first. Closing twice is a
    /// no-op.
    pub fn close(&self, session: &mut Session) -> Result<SessionStatus> {
        if session.is_closed() {
            return Ok(session.status);
        }

        if session.is_open() {
            let dry_run = session.mode == ExecutionMode::DryRun;
            for idx in 0..session.changes.len() {
                let change = &session.changes[idx];
                let in_flight = matches!(
                    change.state,
                    ChangeState::Applied | ChangeState::Validated | ChangeState::Failed
                ) || (change.state == ChangeState::BackedUp && !dry_run);
                if in_flight {
                    tracing::warn!(change = %change.id, target_id = %change.target.id, "Rolling back unfinished change on close");
                    if let Err(e) = self.rollback_change(session, idx) {
                        tracing::error!("{}", e);
                    }
                }
            }

            let settled = session.changes.iter().all(|c| match c.state {
                ChangeState::Committed => true,
                ChangeState::RolledBack => c.settled_by_policy,
                ChangeState::BackedUp => dry_run && c.last_error.is_none(),
                _ => false,
            });
            session.status = if settled {
                SessionStatus::Committed
            } else {
                SessionStatus::Failed
            };
        }

        session.closed_at_ms = Some(now_ms());
        let record = session.record();
        if let Some(mut lock) = session.lock.take() {
            lock.release();
        }
        self.journal.record_session(&record)?;
        tracing::info!(session = %session.id, status = %session.status, "Closed session");
        Ok(session.status)
    }

    /// Run a whole plan through the session, applying the failure policy,
    /// then close it.
    ///
    /// Advisory failures are collected as warnings. A critical failure or
    /// an abort rolls the session back, closes it and returns the error.
    pub fn execute(&self, session: &mut Session, plan: Vec<PlannedChange>) -> Result<SessionReport> {
        session.require_open()?;
        let mut dry_runs = Vec::new();
        let mut warnings = Vec::new();

        for planned in plan {
            if self.abort.is_tripped() {
                tracing::warn!(session = %session.id, "Abort requested, rolling back");
                if let Err(e) = self.rollback_session(session) {
                    tracing::error!("{}", e);
                }
                self.close(session)?;
                return Err(EngineError::Aborted(format!("session {} interrupted", session.id)));
            }

            let target_id = planned.target.id.clone();
            let action = FailureAction::for_target(&planned.target);
            let id = match self.propose(session, planned.target, planned.proposed) {
                Ok(id) => id,
                Err(e) if action == FailureAction::Continue => {
                    tracing::warn!(target_id = %target_id, "Skipping advisory change: {}", e);
                    warnings.push(format!("{target_id}: {e}"));
                    continue;
                }
                Err(e) => {
                    if let Err(rollback_err) = self.rollback_session(session) {
                        tracing::error!("{}", rollback_err);
                    }
                    self.close(session)?;
                    return Err(e);
                }
            };

            match self.run_change(session, id) {
                Ok(Some(outcome)) => dry_runs.push(outcome),
                Ok(None) => {}
                Err(e) if action == FailureAction::Continue => {
                    warnings.push(format!("{target_id}: {e}"));
                }
                Err(e) => {
                    self.close(session)?;
                    return Err(e);
                }
            }
        }

        self.close(session)?;
        Ok(SessionReport::new(session, dry_runs, warnings))
    }

    fn run_change(&self, session: &mut Session, id: ChangeId) -> Result<Option<DryRunOutcome>> {
        self.stage(session, id)?;
        if session.mode == ExecutionMode::DryRun {
            return self.dry_run(session, id).map(Some);
        }
        if self.apply(session, id)? == ApplyOutcome::Declined {
            return Ok(None);
        }
        self.validate(session, id)?;
        self.commit(session, id)?;
        Ok(None)
    }

    /// Roll the failed change back and apply the failure policy
    fn handle_failure(&self, session: &mut Session, idx: usize, err: EngineError) -> EngineError {
        let change = &mut session.changes[idx];
        change.last_error = Some(err.to_string());
        let target_id = change.target.id.clone();
        let action = FailureAction::for_target(&change.target);

        if let Err(e) = self.rollback_change(session, idx) {
            tracing::error!(target_id = %target_id, "Rollback after failure did not complete: {}", e);
        }

        match action {
            FailureAction::Continue => {
                let change = &mut session.changes[idx];
                change.settled_by_policy = change.state == ChangeState::RolledBack;
                self.journal_change(&session.changes[idx]);
                tracing::warn!(target_id = %target_id, "Advisory change failed and was rolled back: {}", err);
            }
            FailureAction::AbortSession => {
                tracing::error!(target_id = %target_id, "Critical change failed, aborting session: {}", err);
                if session.is_open() {
                    if let Err(e) = self.rollback_session(session) {
                        tracing::error!("{}", e);
                    }
                }
            }
        }
        err
    }

    fn rollback_change(&self, session: &mut Session, idx: usize) -> Result<()> {
        if session.changes[idx].state == ChangeState::RolledBack {
            return Ok(());
        }
        if session.changes[idx].state != ChangeState::Failed {
            session.changes[idx].advance(ChangeState::Failed, now_ms())?;
        }

        let change = &session.changes[idx];
        let target = change.target.clone();
        if change.write_attempted() {
            let adapter = self.adapters.for_target(&target)?;
            let restored = self
                .load_backup(change)
                .and_then(|record| self.store.restore(&record, &target, adapter));
            if let Err(e) = restored {
                session.changes[idx].last_error = Some(e.to_string());
                self.journal_change(&session.changes[idx]);
                return Err(e);
            }

            if change.reloaded {
                let reload = run_hook(self.settings.hook_timeout, |budget| adapter.reload(&target, budget));
                if let Err(e) = reload {
                    tracing::warn!(target_id = %target.id, "Reload of restored state failed: {}", e);
                }
            }
        }

        session.changes[idx].advance(ChangeState::RolledBack, now_ms())?;
        tracing::info!(change = %session.changes[idx].id, target_id = %target.id, "Rolled back");
        self.journal_change(&session.changes[idx]);
        Ok(())
    }

    fn load_backup(&self, change: &Change) -> Result<BackupRecord> {
        let meta = change
            .backup_meta
            .as_ref()
            .ok_or_else(|| EngineError::RestoreFailure {
                target: change.target.id.clone(),
                reason: "no backup recorded".to_string(),
            })?;
        BackupRecord::load(meta).map_err(|e| EngineError::RestoreFailure {
            target: change.target.id.clone(),
            reason: e.to_string(),
        })
    }

    fn backup_content(&self, change: &Change) -> Result<Vec<u8>> {
        let record = self.load_backup(change)?;
        std::fs::read(&record.content_path).map_err(|e| EngineError::io(&record.content_path, e))
    }

    fn require_live_mode(&self, session: &Session, op: &str) -> Result<()> {
        if session.mode == ExecutionMode::DryRun {
            return Err(EngineError::ModeViolation(format!("dry_run ({op})")));
        }
        Ok(())
    }

    fn journal_change(&self, change: &Change) {
        if let Err(e) = self.journal.record_change(change) {
            tracing::warn!(change = %change.id, "Failed to journal change: {}", e);
        }
    }

    fn journal_session(&self, session: &Session) {
        if let Err(e) = self.journal.record_session(&session.record()) {
            tracing::warn!(session = %session.id, "Failed to journal session: {}", e);
        }
    }
}

fn expect_state(change: &Change, expected: ChangeState) -> Result<()> {
    if change.state == expected {
        return Ok(());
    }
    let next = match expected {
        ChangeState::Pending => ChangeState::BackedUp,
        ChangeState::BackedUp => ChangeState::Applied,
        ChangeState::Applied => ChangeState::Validated,
        _ => ChangeState::Committed,
    };
    Err(EngineError::IllegalTransition {
        from: change.state.to_string(),
        to: next.to_string(),
    })
}

fn validation_error(target: &Target, err: AdapterError) -> EngineError {
    match err {
        AdapterError::TimedOut(timeout) => EngineError::ValidationTimeout {
            target: target.id.clone(),
            timeout,
        },
        other => EngineError::ValidationFailure {
            target: target.id.clone(),
            reason: other.to_string(),
        },
    }
}

/// Keeps a session from outliving its owner while still open.
///
/// Dropping the guard of a session that is still open rolls everything
/// back and closes it.
pub struct SessionGuard<'a> {
    manager: &'a SessionManager,
    session: Session,
}

impl<'a> SessionGuard<'a> {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn execute(&mut self, plan: Vec<PlannedChange>) -> Result<SessionReport> {
        self.manager.execute(&mut self.session, plan)
    }

    /// Close the session normally
    pub fn finish(mut self) -> Result<SessionStatus> {
        self.manager.close(&mut self.session)
    }
}

impl std::ops::Deref for SessionGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl std::ops::DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.session.is_closed() {
            return;
        }
        if self.session.is_open() {
            tracing::warn!(session = %self.session.id(), "Session dropped while open, rolling back");
            if let Err(e) = self.manager.rollback_session(&mut self.session) {
                tracing::error!("{}", e);
            }
        }
        if let Err(e) = self.manager.close(&mut self.session) {
            tracing::error!("{}", e);
        }
    }
}
