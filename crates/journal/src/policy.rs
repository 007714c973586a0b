//! Failure policy, confirmation and cancellation

use crate::change::ChangeId;
use rampart_core::{AdapterError, AdapterResult, Criticality, Decision, Target};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happens to the session when one of its changes fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Roll back every applied change and abort
    AbortSession,
    /// Roll back just this change and carry on
    Continue,
}

impl FailureAction {
    pub fn for_target(target: &Target) -> Self {
        match target.criticality {
            Criticality::Critical => Self::AbortSession,
            Criticality::Advisory => Self::Continue,
        }
    }
}

/// What a confirmation gate is asked to approve
#[derive(Debug, Clone)]
pub struct ConfirmationRequest<'a> {
    pub change_id: ChangeId,
    pub target: &'a Target,
    /// Unified diff from current to proposed content
    pub diff: &'a str,
}

/// Approves or declines changes before they are written
pub trait ConfirmationGate: Send {
    fn confirm(&mut self, request: &ConfirmationRequest<'_>) -> Decision;
}

/// Gate that always answers the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub Decision);

impl ConfirmationGate for FixedDecision {
    fn confirm(&mut self, _request: &ConfirmationRequest<'_>) -> Decision {
        self.0
    }
}

impl<F> ConfirmationGate for F
where
    F: FnMut(&ConfirmationRequest<'_>) -> Decision + Send,
{
    fn confirm(&mut self, request: &ConfirmationRequest<'_>) -> Decision {
        self(request)
    }
}

/// Cooperative cancellation flag, checked between changes
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a dry run found for one change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunOutcome {
    pub change_id: ChangeId,
    pub target_id: String,
    /// Unified diff, empty when nothing would change
    pub diff: String,
    /// Validation error against the scratch copy, if any
    pub validation_error: Option<String>,
}

impl DryRunOutcome {
    pub fn would_change(&self) -> bool {
        !self.diff.is_empty()
    }

    pub fn passed(&self) -> bool {
        self.validation_error.is_none()
    }
}

/// Unified diff between two versions of a target's content
pub fn unified_diff(label: &str, current: &[u8], proposed: &[u8]) -> String {
    if current == proposed {
        return String::new();
    }
    let old = String::from_utf8_lossy(current);
    let new = String::from_utf8_lossy(proposed);
    let diff = similar::TextDiff::from_lines(old.as_ref(), new.as_ref());
    let rendered = diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("{label} (current)"), &format!("{label} (proposed)"))
        .to_string();
    rendered
}

/// Run an adapter hook against its time budget.
///
/// Hooks are expected to honor the budget they are handed; one that reports
/// success after overrunning it is still treated as timed out.
pub fn run_hook<T>(budget: Duration, hook: impl FnOnce(Duration) -> AdapterResult<T>) -> AdapterResult<T> {
    let started = Instant::now();
    let result = hook(budget);
    let elapsed = started.elapsed();
    match result {
        Ok(_) if elapsed > budget => Err(AdapterError::TimedOut(budget)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::TargetKind;

    #[test]
    fn test_failure_action_follows_criticality() {
        let ssh = Target::new("sshd_config", TargetKind::File, "/etc/ssh/sshd_config", Criticality::Critical);
        let ufw = Target::new("ufw-rules", TargetKind::Ruleset, "ufw", Criticality::Advisory);
        assert_eq!(FailureAction::for_target(&ssh), FailureAction::AbortSession);
        assert_eq!(FailureAction::for_target(&ufw), FailureAction::Continue);
    }

    #[test]
    fn test_abort_signal_shared() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_tripped());
        clone.trip();
        assert!(signal.is_tripped());
    }

    #[test]
    fn test_closure_gate() {
        let target = Target::new("a", TargetKind::File, "/etc/a", Criticality::Advisory);
        let mut asked = 0;
        let mut gate = |_: &ConfirmationRequest<'_>| {
            asked += 1;
            Decision::Decline
        };
        let request = ConfirmationRequest {
            change_id: ChangeId::new(),
            target: &target,
            diff: "",
        };
        assert_eq!(gate.confirm(&request), Decision::Decline);
        drop(gate);
        assert_eq!(asked, 1);
    }

    #[test]
    fn test_unified_diff() {
        let diff = unified_diff("sshd_config", b"Port 22\nPermitRootLogin yes\n", b"Port 2222\nPermitRootLogin yes\n");
        assert!(diff.contains("-Port 22\n"));
        assert!(diff.contains("+Port 2222\n"));
        assert!(unified_diff("x", b"same", b"same").is_empty());
    }

    #[test]
    fn test_run_hook_overrun_is_timeout() {
        let result = run_hook(Duration::from_millis(10), |_| {
            std::thread::sleep(Duration::from_millis(40));
            Ok(())
        });
        assert!(matches!(result, Err(AdapterError::TimedOut(_))));

        let result = run_hook(Duration::from_secs(5), |budget| {
            assert_eq!(budget, Duration::from_secs(5));
            Ok(7)
        });
        assert_eq!(result.unwrap(), 7);
    }
}
