//! Purge expired session backups

use crate::util::{self, GlobalArgs};
use anyhow::Result;
use owo_colors::OwoColorize;
use rampart_journal::{GarbageCollector, RetentionPolicy};

pub async fn run(global: &GlobalArgs, retention_days: Option<u64>) -> Result<()> {
    let config = global.load_config()?;
    // Never race a live session on the host scope
    let _lock = util::lock_manager(&config).acquire(util::HOST_SCOPE, config.lock_timeout())?;
    let store = util::open_store(&config)?;
    let journal = util::open_journal(&config)?;

    let mut policy = RetentionPolicy::from_config(&config);
    if let Some(days) = retention_days {
        policy.retention_days = days;
    }
    let gc = GarbageCollector::new(policy.clone());

    if !global.json {
        println!(
            "{} {}",
            "Running Cleanup...".bold(),
            format!("(keeping {} days)", policy.retention_days).dimmed()
        );
        println!();
    }

    let report = gc.collect(&store, &journal)?;

    if global.json {
        return util::print_json(&report);
    }

    println!("{}", "Cleanup Complete".green().bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    if report.records_deleted == 0 && report.orphans_deleted == 0 && report.sessions_removed == 0 {
        println!("{}", "No expired backups - nothing to remove".dimmed());
    } else {
        println!("Backups deleted:     {}", report.records_deleted.to_string().yellow());
        println!("Orphans deleted:     {}", report.orphans_deleted.to_string().yellow());
        println!("Session dirs removed: {}", report.sessions_removed.to_string().yellow());
        println!();
        println!(
            "Space freed:         {}",
            util::format_size(report.bytes_freed).green()
        );
    }

    if report.records_protected > 0 {
        println!();
        println!(
            "{}",
            format!(
                "Kept {} backup(s) belonging to open or failed sessions",
                report.records_protected
            )
            .dimmed()
        );
    }
    Ok(())
}
