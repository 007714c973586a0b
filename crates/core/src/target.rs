//! Mutable system resources and the adapter contract used to touch them

use crate::error::{AdapterResult, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Kind of resource a target points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Plain configuration file, `locator` is its path
    File,
    /// Service state, `locator` is the unit name
    Service,
    /// Firewall/jail rule set, `locator` names the rule set
    Ruleset,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Service => "service",
            Self::Ruleset => "ruleset",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "service" => Ok(Self::Service),
            "ruleset" => Ok(Self::Ruleset),
            other => Err(format!("unknown target kind '{other}'")),
        }
    }
}

/// Failure-policy classification of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure aborts the whole session (e.g. SSH)
    Critical,
    /// Failure rolls back only the one change (e.g. a UFW rule tweak)
    Advisory,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Advisory => "advisory",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criticality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "advisory" => Ok(Self::Advisory),
            other => Err(format!("unknown criticality '{other}'")),
        }
    }
}

/// A mutable resource owned by a hardening module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier, also used as the backup file stem
    pub id: String,
    pub kind: TargetKind,
    /// Path (file) or service / rule set name
    pub locator: String,
    pub criticality: Criticality,
}

impl Target {
    pub fn new(
        id: impl Into<String>,
        kind: TargetKind,
        locator: impl Into<String>,
        criticality: Criticality,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            locator: locator.into(),
            criticality,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }

    /// Reject ids that cannot safely become file names
    pub fn check_id(&self) -> Result<()> {
        let ok = !self.id.is_empty()
            && self.id != "."
            && self.id != ".."
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
        if ok {
            Ok(())
        } else {
            Err(EngineError::Config(format!("invalid target id '{}'", self.id)))
        }
    }
}

/// What a validation hook should look at
#[derive(Debug, Clone, Copy)]
pub enum ValidationSubject<'a> {
    /// The live, just-written target
    Live,
    /// A scratch copy holding proposed content (dry runs)
    Scratch(&'a Path),
}

/// Whether a reload actually happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    /// Target has nothing to reload; no health check follows
    NotApplicable,
}

/// Per-kind capability to read, write and check a target.
///
/// Implemented by the hardening modules. Every hook receives the target it
/// acts on, so one adapter serves every target of its kind. Hooks that can
/// block are handed their time budget and must give up once it is spent.
pub trait TargetAdapter: Send + Sync {
    /// Current persisted state (file bytes or serialized dump)
    fn read(&self, target: &Target) -> AdapterResult<Vec<u8>>;

    /// Replace the persisted state; also the "load serialized state" hook
    /// used when restoring non-file targets
    fn write(&self, target: &Target, state: &[u8]) -> AdapterResult<()>;

    /// Syntax / semantic check of the target or a scratch copy of it
    fn validate(
        &self,
        target: &Target,
        subject: ValidationSubject<'_>,
        timeout: Duration,
    ) -> AdapterResult<()>;

    /// Make the running service pick up the persisted state
    fn reload(&self, _target: &Target, _timeout: Duration) -> AdapterResult<ReloadOutcome> {
        Ok(ReloadOutcome::NotApplicable)
    }

    /// Post-reload check (e.g. port listening)
    fn health_check(&self, _target: &Target, _timeout: Duration) -> AdapterResult<()> {
        Ok(())
    }
}

/// One adapter per target kind
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<TargetKind, Box<dyn TargetAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for a kind
    pub fn register(&mut self, kind: TargetKind, adapter: Box<dyn TargetAdapter>) -> &mut Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn with(mut self, kind: TargetKind, adapter: Box<dyn TargetAdapter>) -> Self {
        self.register(kind, adapter);
        self
    }

    /// Adapter responsible for `target`
    pub fn for_target(&self, target: &Target) -> Result<&dyn TargetAdapter> {
        self.adapters
            .get(&target.kind)
            .map(|a| a.as_ref())
            .ok_or_else(|| EngineError::NoAdapter(target.kind.to_string()))
    }
}
