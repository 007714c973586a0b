//! A throwaway host layout for end-to-end runs
//!
//! Every directory the engine touches (backups, restore points, journal,
//! lock files) lives inside one temp directory, and the managed "system"
//! files sit under `etc/` next to them.

use anyhow::{Context, Result};
use rampart_core::{EngineConfig, LockManager};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestHost {
    temp_dir: TempDir,
    config_path: PathBuf,
    config: EngineConfig,
}

impl TestHost {
    /// Create a host with a config pointing every path into the temp dir
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temp dir")?;
        let root = temp_dir.path();

        let mut config = EngineConfig::default();
        config.paths.backup_root = root.join("var/backups/sessions");
        config.paths.restore_point_root = root.join("var/backups/restore-points");
        config.paths.journal_dir = root.join("var/lib/journal");
        config.paths.runtime_dir = root.join("run");
        config.timeouts.hook_timeout_secs = 5;
        config.timeouts.lock_timeout_secs = 10;

        fs::create_dir_all(root.join("etc"))?;
        let config_path = root.join("config.toml");
        config.save_to(&config_path)?;

        Ok(Self {
            temp_dir,
            config_path,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config(&self) -> &Path {
        &self.config_path
    }

    /// Path of a managed file under `etc/`
    pub fn etc(&self, name: &str) -> PathBuf {
        self.root().join("etc").join(name)
    }

    /// Write a managed file and return its path as a string
    pub fn write_etc(&self, name: &str, content: &str) -> Result<String> {
        let path = self.etc(name);
        fs::write(&path, content)?;
        Ok(path.display().to_string())
    }

    pub fn read_etc(&self, name: &str) -> Result<String> {
        fs::read_to_string(self.etc(name)).with_context(|| format!("Failed to read etc/{name}"))
    }

    /// Write a plan file next to the config and return its path
    pub fn write_plan(&self, name: &str, toml: &str) -> Result<String> {
        let path = self.root().join(name);
        fs::write(&path, toml)?;
        Ok(path.display().to_string())
    }

    /// A lock manager sharing the binary's runtime dir
    pub fn locks(&self) -> LockManager {
        LockManager::new(
            self.config.paths.runtime_dir.clone(),
            Duration::from_secs(self.config.timeouts.lock_stale_secs),
        )
    }

    /// Number of entries in the restore point root
    pub fn restore_point_count(&self) -> usize {
        fs::read_dir(&self.config.paths.restore_point_root)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}
