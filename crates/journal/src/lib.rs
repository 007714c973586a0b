//! Session engine and audit journal
//!
//! This crate provides:
//! - Change and Session state machines
//! - Session manager with failure policy and execution modes
//! - Append-only audit journal (sled embedded DB)
//! - Restore points
//! - Retention policies & GC

pub mod change;
pub mod engine;
pub mod journal;
pub mod policy;
pub mod restore_point;
pub mod retention;
pub mod session;

// Re-exports
pub use change::{Change, ChangeId, ChangeState};
pub use engine::{
    ApplyOutcome, ChangeSummary, EngineSettings, PlannedChange, SessionGuard, SessionManager,
    SessionReport,
};
pub use journal::Journal;
pub use policy::{
    AbortSignal, ConfirmationGate, ConfirmationRequest, DryRunOutcome, FailureAction, FixedDecision,
};
pub use restore_point::{RestorePoint, RestorePointManager, RestoreReport};
pub use retention::{GarbageCollector, RetentionPolicy};
pub use session::{ExecutionMode, Session, SessionId, SessionRecord, SessionStatus};
