//! Named multi-target snapshots taken outside any session

use crate::plan::Plan;
use crate::util::{self, GlobalArgs};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use rampart_core::time::display_time;
use rampart_core::{AdapterRegistry, EngineConfig};
use rampart_journal::{RestorePoint, RestorePointManager};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct PointSummary {
    id: String,
    name: String,
    created_at_ms: u64,
    description: String,
    created_by: String,
    targets: Vec<String>,
    records: usize,
}

impl From<&RestorePoint> for PointSummary {
    fn from(point: &RestorePoint) -> Self {
        Self {
            id: point.id.clone(),
            name: point.name.clone(),
            created_at_ms: point.created_at_ms,
            description: point.description.clone(),
            created_by: point.created_by.clone(),
            targets: point.target_ids.clone(),
            records: point.records.len(),
        }
    }
}

fn open_manager(config: &EngineConfig) -> Result<RestorePointManager> {
    RestorePointManager::open(&config.paths.restore_point_root).with_context(|| {
        format!(
            "Failed to open restore points at {}",
            config.paths.restore_point_root.display()
        )
    })
}

/// Adapters from the plan, or plain file access when there is none
fn adapters_for(plan: Option<&Plan>, config: &EngineConfig) -> AdapterRegistry {
    let runtime = tokio::runtime::Handle::current();
    match plan {
        Some(plan) => plan.adapters(runtime, config.hook_timeout()),
        None => crate::adapters::CommandAdapter::registry(
            Arc::new(HashMap::new()),
            runtime,
            config.hook_timeout(),
        ),
    }
}

/// Snapshot every target of a plan under `name`
pub async fn run_create(
    global: &GlobalArgs,
    name: &str,
    plan_path: &Path,
    description: Option<String>,
) -> Result<()> {
    let config = global.load_config()?;
    let plan = Plan::load(plan_path)?;
    let targets = plan.targets();
    if targets.is_empty() {
        anyhow::bail!("Plan {} lists no targets", plan_path.display());
    }

    let manager = open_manager(&config)?;
    let adapters = adapters_for(Some(&plan), &config);
    let name = name.to_string();
    let description = description.unwrap_or_default();

    let point = tokio::task::spawn_blocking(move || {
        manager.create(&name, &description, &targets, &adapters)
    })
    .await
    .context("Restore point task failed")?
    .context("Failed to create restore point")?;

    if global.json {
        return util::print_json(&PointSummary::from(&point));
    }
    println!(
        "{} Created restore point {}",
        "✓".green(),
        point.id.cyan()
    );
    println!("  Targets:  {}", point.target_ids.join(", "));
    println!("  Location: {}", point.path.display().to_string().dimmed());
    Ok(())
}

/// List restore points, newest first
pub async fn run_list(global: &GlobalArgs) -> Result<()> {
    let config = global.load_config()?;
    let points = open_manager(&config)?.list()?;

    if global.json {
        let summaries: Vec<PointSummary> = points.iter().map(PointSummary::from).collect();
        return util::print_json(&summaries);
    }

    if points.is_empty() {
        println!("{}", "No restore points".dimmed());
        return Ok(());
    }

    println!("{}", "Restore Points".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for point in &points {
        println!();
        println!("{}", point.id.yellow());
        println!(
            "  Created:  {} {}",
            display_time(point.created_at_ms),
            format!("({}, by {})", util::format_relative_time(point.created_at_ms), point.created_by).dimmed()
        );
        if !point.description.is_empty() {
            println!("  About:    {}", point.description);
        }
        println!("  Targets:  {}", point.target_ids.join(", ").cyan());
    }
    Ok(())
}

/// Put every target of a restore point back
pub async fn run_restore(
    global: &GlobalArgs,
    reference: &str,
    plan_path: Option<&Path>,
    yes: bool,
) -> Result<()> {
    let config = global.load_config()?;
    let manager = open_manager(&config)?;
    let point = manager.resolve(reference)?;

    if !yes {
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("Refusing to restore without confirmation; pass --yes");
        }
        eprint!(
            "Restore {} target(s) from {}? [y/N] ",
            point.records.len(),
            point.id.yellow()
        );
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            println!("{}", "Restore cancelled".dimmed());
            return Ok(());
        }
    }

    let plan = plan_path.map(Plan::load).transpose()?;
    let _lock = util::lock_manager(&config).acquire(util::HOST_SCOPE, config.lock_timeout())?;
    let adapters = adapters_for(plan.as_ref(), &config);
    let order = config.session.restore_order.clone();
    let id = point.id.clone();

    let report = tokio::task::spawn_blocking(move || manager.restore(&id, &order, &adapters))
        .await
        .context("Restore task failed")??;

    if global.json {
        util::print_json(&report)?;
    } else {
        for target in &report.restored {
            println!("{} {}", "✓".green(), target.cyan());
        }
        for (target, reason) in &report.failed {
            println!("{} {}  {}", "✗".red(), target.cyan(), reason.dimmed());
        }
    }

    if !report.is_complete() {
        anyhow::bail!(
            "{} of {} target(s) could not be restored from {}",
            report.failed.len(),
            report.failed.len() + report.restored.len(),
            point.id
        );
    }
    if !global.json {
        println!("\n{} Restored {}", "✓".green(), point.id.cyan());
    }
    Ok(())
}

/// Remove a restore point
pub async fn run_delete(global: &GlobalArgs, reference: &str) -> Result<()> {
    let config = global.load_config()?;
    let point = open_manager(&config)?.delete(reference)?;
    if global.json {
        return util::print_json(&PointSummary::from(&point));
    }
    println!("{} Deleted restore point {}", "✓".green(), point.id.cyan());
    Ok(())
}
