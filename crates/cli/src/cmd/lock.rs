//! Inspect the host lock

use crate::util::{self, GlobalArgs};
use anyhow::Result;
use owo_colors::OwoColorize;
use rampart_core::time::display_time;
use rampart_core::LockState;
use serde_json::json;

pub async fn run(global: &GlobalArgs, scope: &str) -> Result<()> {
    let config = global.load_config()?;
    let locks = util::lock_manager(&config);
    let state = locks.inspect(scope)?;

    if global.json {
        let value = match &state {
            LockState::Free => json!({ "scope": scope, "state": "free" }),
            LockState::Held(holder) => json!({
                "scope": scope,
                "state": "held",
                "pid": holder.pid,
                "acquired_at_ms": holder.acquired_at_ms,
            }),
            LockState::Acquiring => json!({ "scope": scope, "state": "acquiring" }),
            LockState::Stale(holder) => json!({
                "scope": scope,
                "state": "stale",
                "pid": holder.as_ref().map(|h| h.pid),
                "acquired_at_ms": holder.as_ref().map(|h| h.acquired_at_ms),
            }),
        };
        return util::print_json(&value);
    }

    println!("Lock:    {} {}", scope.cyan(), locks.lock_path(scope).display().to_string().dimmed());
    match state {
        LockState::Free => println!("State:   {}", "free".green()),
        LockState::Held(holder) => {
            println!("State:   {}", "held".yellow());
            println!("  PID:   {}", holder.pid);
            println!(
                "  Since: {} ({})",
                display_time(holder.acquired_at_ms),
                util::format_relative_time(holder.acquired_at_ms).dimmed()
            );
        }
        LockState::Acquiring => {
            println!("State:   {}", "acquiring".yellow());
            println!("  {}", "Another run is taking the lock".dimmed());
        }
        LockState::Stale(holder) => {
            println!("State:   {}", "stale".red());
            if let Some(holder) = holder {
                println!("  PID:   {} {}", holder.pid, "(no longer running)".dimmed());
            }
            println!(
                "  {}",
                "The next run reclaims it automatically".dimmed()
            );
        }
    }
    Ok(())
}
