//! Engine configuration
//!
//! Loaded from `$RAMPART_CONFIG`, then `/etc/rampart/config.toml`, then the
//! per-user config directory. Missing files mean defaults; missing fields
//! fall back to their defaults individually.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_ENV: &str = "RAMPART_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/rampart/config.toml";

/// Answer given in place of an interactive confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Decline,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "approve",
            Self::Decline => "decline",
        })
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "decline" => Ok(Self::Decline),
            other => Err(format!("unknown decision '{other}' (expected approve or decline)")),
        }
    }
}

/// Where things live on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub backup_root: PathBuf,
    pub restore_point_root: PathBuf,
    pub journal_dir: PathBuf,
    pub runtime_dir: PathBuf,
    /// Daily rolling log files go here when set
    pub log_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/backups/rampart/sessions"),
            restore_point_root: PathBuf::from("/var/backups/rampart/restore-points"),
            journal_dir: PathBuf::from("/var/lib/rampart/journal"),
            runtime_dir: PathBuf::from("/run/rampart"),
            log_dir: None,
        }
    }
}

/// Time budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Per adapter hook (write, validate, reload)
    pub hook_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    /// Locks older than this are reclaimed even if the holder is alive
    pub lock_stale_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            hook_timeout_secs: 10,
            health_timeout_secs: 5,
            lock_timeout_secs: 30,
            lock_stale_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used instead of prompting in non-interactive mode
    pub default_decision: Decision,
    /// Target ids restored first, in this order, when rolling back to a
    /// restore point
    pub restore_order: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_decision: Decision::Approve,
            restore_order: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub timeouts: TimeoutsConfig,
    pub session: SessionConfig,
    pub retention: RetentionConfig,
}

impl EngineConfig {
    /// Every key accepted by [`get`](Self::get) / [`set`](Self::set)
    pub const KEYS: &'static [&'static str] = &[
        "paths.backup_root",
        "paths.restore_point_root",
        "paths.journal_dir",
        "paths.runtime_dir",
        "paths.log_dir",
        "timeouts.hook_timeout_secs",
        "timeouts.health_timeout_secs",
        "timeouts.lock_timeout_secs",
        "timeouts.lock_stale_secs",
        "session.default_decision",
        "session.restore_order",
        "retention.retention_days",
    ];

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.hook_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.health_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.lock_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.timeouts.lock_stale_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention.retention_days * 86_400)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        ensure(
            (1..=300).contains(&t.hook_timeout_secs),
            "timeouts.hook_timeout_secs must be between 1 and 300",
        )?;
        ensure(
            (1..=120).contains(&t.health_timeout_secs),
            "timeouts.health_timeout_secs must be between 1 and 120",
        )?;
        ensure(
            t.lock_timeout_secs <= 3600,
            "timeouts.lock_timeout_secs must be at most 3600",
        )?;
        ensure(
            (60..=7 * 86_400).contains(&t.lock_stale_secs),
            "timeouts.lock_stale_secs must be between 60 and 604800",
        )?;
        ensure(
            (1..=3650).contains(&self.retention.retention_days),
            "retention.retention_days must be between 1 and 3650",
        )?;

        let p = &self.paths;
        for (key, path) in [
            ("paths.backup_root", &p.backup_root),
            ("paths.restore_point_root", &p.restore_point_root),
            ("paths.journal_dir", &p.journal_dir),
            ("paths.runtime_dir", &p.runtime_dir),
        ] {
            ensure(path.is_absolute(), &format!("{key} must be an absolute path"))?;
        }
        ensure(
            p.backup_root != p.restore_point_root,
            "paths.backup_root and paths.restore_point_root must differ",
        )?;
        Ok(())
    }

    /// Render one key's value
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "paths.backup_root" => self.paths.backup_root.display().to_string(),
            "paths.restore_point_root" => self.paths.restore_point_root.display().to_string(),
            "paths.journal_dir" => self.paths.journal_dir.display().to_string(),
            "paths.runtime_dir" => self.paths.runtime_dir.display().to_string(),
            "paths.log_dir" => self
                .paths
                .log_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "timeouts.hook_timeout_secs" => self.timeouts.hook_timeout_secs.to_string(),
            "timeouts.health_timeout_secs" => self.timeouts.health_timeout_secs.to_string(),
            "timeouts.lock_timeout_secs" => self.timeouts.lock_timeout_secs.to_string(),
            "timeouts.lock_stale_secs" => self.timeouts.lock_stale_secs.to_string(),
            "session.default_decision" => self.session.default_decision.to_string(),
            "session.restore_order" => self.session.restore_order.join(","),
            "retention.retention_days" => self.retention.retention_days.to_string(),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Parse and assign one key. Does not validate ranges.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "paths.backup_root" => self.paths.backup_root = PathBuf::from(value),
            "paths.restore_point_root" => self.paths.restore_point_root = PathBuf::from(value),
            "paths.journal_dir" => self.paths.journal_dir = PathBuf::from(value),
            "paths.runtime_dir" => self.paths.runtime_dir = PathBuf::from(value),
            "paths.log_dir" => {
                self.paths.log_dir = (!value.is_empty()).then(|| PathBuf::from(value))
            }
            "timeouts.hook_timeout_secs" => self.timeouts.hook_timeout_secs = parse_num(key, value)?,
            "timeouts.health_timeout_secs" => {
                self.timeouts.health_timeout_secs = parse_num(key, value)?
            }
            "timeouts.lock_timeout_secs" => self.timeouts.lock_timeout_secs = parse_num(key, value)?,
            "timeouts.lock_stale_secs" => self.timeouts.lock_stale_secs = parse_num(key, value)?,
            "session.default_decision" => {
                self.session.default_decision = value.parse().map_err(EngineError::Config)?
            }
            "session.restore_order" => {
                self.session.restore_order = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }
            "retention.retention_days" => self.retention.retention_days = parse_num(key, value)?,
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let config = Self::from_toml(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the first existing config location, or defaults
    pub fn load() -> Result<Self> {
        match existing_config_path() {
            Some(path) => {
                tracing::debug!("Loading config from {}", path.display());
                Self::load_from(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Validate and write to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        crate::store::atomic_write(parent, path, self.to_toml()?.as_bytes())
    }
}

/// File that `load` reads and `config set` writes.
///
/// `$RAMPART_CONFIG` wins; otherwise the system file when it exists or we
/// are root, else the per-user file.
pub fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() || nix::unistd::geteuid().is_root() {
        return Some(system);
    }
    dirs::config_dir().map(|d| d.join("rampart").join("config.toml"))
}

fn existing_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        return Some(system);
    }
    dirs::config_dir()
        .map(|d| d.join("rampart").join("config.toml"))
        .filter(|p| p.exists())
}

/// Commented example configuration
pub fn example_config() -> String {
    r#"# Rampart engine configuration

[paths]
backup_root = "/var/backups/rampart/sessions"
restore_point_root = "/var/backups/rampart/restore-points"
journal_dir = "/var/lib/rampart/journal"
runtime_dir = "/run/rampart"
# log_dir = "/var/log/rampart"

[timeouts]
# Budget per validate / write / reload hook (1-300)
hook_timeout_secs = 10
# Post-reload health check (1-120)
health_timeout_secs = 5
# How long a second run waits for the host lock (0-3600)
lock_timeout_secs = 30
# Locks older than this are reclaimed (60-604800)
lock_stale_secs = 3600

[session]
# approve | decline, used in non-interactive mode
default_decision = "approve"
# Restore these targets first (firewall before SSH)
restore_order = ["ufw-rules", "fail2ban-jail", "sshd_config"]

[retention]
retention_days = 30
"#
    .to_string()
}

fn ensure(cond: bool, msg: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(EngineError::Config(msg.to_string()))
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{key} must be a non-negative integer")))
}

fn unknown_key(key: &str) -> EngineError {
    EngineError::Config(format!("unknown config key '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hook_timeout(), Duration::from_secs(10));
        assert_eq!(config.health_timeout(), Duration::from_secs(5));
        assert_eq!(config.retention(), Duration::from_secs(30 * 86_400));
        assert_eq!(config.session.default_decision, Decision::Approve);
    }

    #[test]
    fn test_example_parses_and_validates() {
        let config = EngineConfig::from_toml(&example_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.session.restore_order.len(), 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = EngineConfig::from_toml("[timeouts]\nhook_timeout_secs = 20\n").unwrap();
        assert_eq!(config.timeouts.hook_timeout_secs, 20);
        assert_eq!(config.timeouts.health_timeout_secs, 5);
        assert_eq!(config.retention.retention_days, 30);
    }

    #[test]
    fn test_range_checks() {
        let mut config = EngineConfig::default();
        config.timeouts.hook_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.paths.journal_dir = PathBuf::from("relative/journal");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_set_every_key() {
        let mut config = EngineConfig::default();
        for key in EngineConfig::KEYS {
            let value = config.get(key).unwrap();
            config.set(key, &value).unwrap();
        }
        assert_eq!(config, EngineConfig::default());

        config.set("session.restore_order", "ufw-rules, sshd_config").unwrap();
        assert_eq!(config.session.restore_order, vec!["ufw-rules", "sshd_config"]);
        assert!(config.set("session.default_decision", "maybe").is_err());
        assert!(config.set("timeouts.hook_timeout_secs", "-1").is_err());
        assert!(config.get("nope").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("etc").join("config.toml");

        let mut config = EngineConfig::default();
        config.retention.retention_days = 7;
        config.save_to(&path).unwrap();

        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }
}
