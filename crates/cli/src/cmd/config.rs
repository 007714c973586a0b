//! Configuration management command
//!
//! Provides CLI interface to view and edit engine configuration.

use crate::util::{self, GlobalArgs};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use rampart_core::config::{config_file_path, example_config};
use rampart_core::EngineConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// File `set` writes to and `path` reports
fn target_path(global: &GlobalArgs) -> Result<PathBuf> {
    match &global.config {
        Some(path) => Ok(path.clone()),
        None => config_file_path().context("Could not determine config file path"),
    }
}

/// List all configuration values
pub async fn run_list(global: &GlobalArgs) -> Result<()> {
    let config = global.load_config()?;

    if global.json {
        let values = EngineConfig::KEYS
            .iter()
            .map(|key| -> Result<(String, String)> { Ok((key.to_string(), config.get(key)?)) })
            .collect::<Result<BTreeMap<String, String>>>()?;
        return util::print_json(&values);
    }

    let config_path = target_path(global)?;
    println!("{}", "Engine Configuration".bold());
    let location = if config_path.exists() {
        config_path.display().to_string()
    } else {
        format!("{} (not present, using defaults)", config_path.display())
    };
    println!("{}: {}", "Location".dimmed(), location.dimmed());

    let mut section = "";
    for key in EngineConfig::KEYS {
        let (head, name) = key.split_once('.').unwrap_or(("", *key));
        if head != section {
            println!("\n{}", format!("[{head}]").yellow());
            section = head;
        }
        let value = config.get(key)?;
        let hint = match *key {
            "timeouts.lock_stale_secs" => format!("({} min)", config.timeouts.lock_stale_secs / 60),
            "paths.log_dir" if value.is_empty() => "(stderr only)".to_string(),
            "session.restore_order" if value.is_empty() => "(kind order)".to_string(),
            _ => String::new(),
        };
        println!("  {} = {} {}", name.cyan(), value, hint.dimmed());
    }

    println!("\n{}", "Valid Ranges:".bold());
    println!("  hook_timeout_secs: 1-300");
    println!("  health_timeout_secs: 1-120");
    println!("  lock_timeout_secs: 0-3600");
    println!("  lock_stale_secs: 60-604800");
    println!("  retention_days: 1-3650");
    println!("  default_decision: approve | decline");

    Ok(())
}

/// Get a single configuration value
pub async fn run_get(global: &GlobalArgs, key: &str) -> Result<()> {
    let config = global.load_config()?;
    let value = config
        .get(key)
        .context("Use 'rampart config list' to see available keys")?;
    println!("{}", value);
    Ok(())
}

/// Set a configuration value
pub async fn run_set(global: &GlobalArgs, key: &str, value: &str) -> Result<()> {
    let config_path = target_path(global)?;
    let mut config = if config_path.exists() {
        util::load_config(Some(&config_path))?
    } else {
        EngineConfig::default()
    };

    config
        .set(key, value)
        .with_context(|| format!("Cannot set {key}"))?;

    // Validate before saving
    config.validate().context("Invalid configuration value")?;
    config
        .save_to(&config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("{} {} = {}", "✓".green(), key.cyan(), value);
    Ok(())
}

/// Show the config file path and optionally create it
pub async fn run_path(global: &GlobalArgs, create: bool) -> Result<()> {
    let config_path = target_path(global)?;

    if create && !config_path.exists() {
        EngineConfig::default()
            .save_to(&config_path)
            .with_context(|| format!("Failed to create {}", config_path.display()))?;
        println!("{} Created config file at: {}", "✓".green(), config_path.display());
    } else if config_path.exists() {
        println!("{}", config_path.display());
    } else {
        println!("{}", config_path.display());
        println!("{}", "File does not exist. Use --create to create it.".yellow());
    }

    Ok(())
}

/// Show example configuration
pub async fn run_example() -> Result<()> {
    println!("{}", example_config());
    Ok(())
}
