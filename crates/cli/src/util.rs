//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use rampart_core::{BackupStore, EngineConfig, LockManager};
use rampart_journal::{ChangeState, Journal, SessionStatus};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lock scope guarding whole-host changes
pub const HOST_SCOPE: &str = "host";

/// Global options every command sees
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Explicit config file, overriding the usual search
    pub config: Option<PathBuf>,
    /// Machine-readable output
    pub json: bool,
}

impl GlobalArgs {
    pub fn load_config(&self) -> Result<EngineConfig> {
        load_config(self.config.as_deref())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => EngineConfig::load().context("Failed to load config"),
    }
}

/// Open the journal, waiting out a run that currently has it open
pub fn open_journal(config: &EngineConfig) -> Result<Journal> {
    open_journal_wait(config, config.lock_timeout())
}

pub fn open_journal_wait(config: &EngineConfig, timeout: Duration) -> Result<Journal> {
    Journal::open_wait(&config.paths.journal_dir, timeout).with_context(|| {
        format!(
            "Failed to open journal at {}",
            config.paths.journal_dir.display()
        )
    })
}

pub fn open_store(config: &EngineConfig) -> Result<BackupStore> {
    BackupStore::open(&config.paths.backup_root).with_context(|| {
        format!(
            "Failed to open backup store at {}",
            config.paths.backup_root.display()
        )
    })
}

pub fn lock_manager(config: &EngineConfig) -> LockManager {
    LockManager::new(&config.paths.runtime_dir, config.lock_stale_after())
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

/// First eight characters of an id
pub fn short_id(id: impl ToString) -> String {
    let mut id = id.to_string();
    id.truncate(8);
    id
}

pub fn paint_status(status: SessionStatus) -> String {
    match status {
        SessionStatus::Committed => status.green().to_string(),
        SessionStatus::Open => status.cyan().to_string(),
        SessionStatus::RolledBack => status.yellow().to_string(),
        SessionStatus::Failed => status.red().to_string(),
    }
}

pub fn paint_state(state: ChangeState) -> String {
    match state {
        ChangeState::Committed => state.green().to_string(),
        ChangeState::RolledBack => state.yellow().to_string(),
        ChangeState::Failed => state.red().to_string(),
        _ => state.cyan().to_string(),
    }
}

/// Format timestamp as relative time ("2 hours ago")
pub fn format_relative_time(ts_ms: u64) -> String {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let duration = Duration::from_millis(ts_ms);
    let datetime = UNIX_EPOCH + duration;

    if let Ok(elapsed) = SystemTime::now().duration_since(datetime) {
        let seconds = elapsed.as_secs();

        if seconds < 60 {
            format!("{} seconds ago", seconds)
        } else if seconds < 3600 {
            format!("{} minutes ago", seconds / 60)
        } else if seconds < 86400 {
            format!("{} hours ago", seconds / 3600)
        } else if seconds < 604800 {
            format!("{} days ago", seconds / 86400)
        } else {
            format!("{} weeks ago", seconds / 604800)
        }
    } else {
        "in the future".to_string()
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(format_size(1536), "1.50 KB");
    }

    #[test]
    fn test_format_relative_time() {
        let now_ms = rampart_core::time::now_ms();

        let result = format_relative_time(now_ms);
        assert!(result.contains("seconds ago"));

        let result = format_relative_time(now_ms - 3600 * 1000);
        assert!(result.contains("hour"));

        let result = format_relative_time(now_ms - 86400 * 1000);
        assert!(result.contains("day"));

        assert_eq!(format_relative_time(now_ms + 3_600_000), "in the future");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("01HN8XYZABCDEFGH"), "01HN8XYZ");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_load_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[retention]\nretention_days = 7\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.retention.retention_days, 7);
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
