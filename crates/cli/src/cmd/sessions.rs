//! Session history from the journal

use crate::util::{self, GlobalArgs};
use anyhow::Result;
use owo_colors::OwoColorize;
use rampart_core::time::display_time;
use rampart_core::{Criticality, TargetKind};
use rampart_journal::{Change, ChangeId, ChangeState, SessionRecord};
use serde::Serialize;
use ulid::Ulid;

/// A change as shown to operators; proposed content is summarized
#[derive(Debug, Serialize)]
struct ChangeView {
    id: ChangeId,
    target_id: String,
    kind: TargetKind,
    locator: String,
    criticality: Criticality,
    state: ChangeState,
    proposed_bytes: usize,
    backup_record_id: Option<Ulid>,
    apply_seq: Option<u32>,
    reloaded: bool,
    error: Option<String>,
    updated_at_ms: u64,
}

impl From<&Change> for ChangeView {
    fn from(change: &Change) -> Self {
        Self {
            id: change.id,
            target_id: change.target.id.clone(),
            kind: change.target.kind,
            locator: change.target.locator.clone(),
            criticality: change.target.criticality,
            state: change.state,
            proposed_bytes: change.proposed.len(),
            backup_record_id: change.backup_record_id,
            apply_seq: change.apply_seq,
            reloaded: change.reloaded,
            error: change.last_error.clone(),
            updated_at_ms: change.updated_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionView<'a> {
    #[serde(flatten)]
    session: &'a SessionRecord,
    changes: Vec<ChangeView>,
}

/// List recent sessions, newest first
pub async fn run_list(global: &GlobalArgs, limit: Option<usize>) -> Result<()> {
    let config = global.load_config()?;
    let journal = util::open_journal(&config)?;
    let mut sessions = journal.sessions()?;
    sessions.truncate(limit.unwrap_or(20));

    if global.json {
        return util::print_json(&sessions);
    }

    if sessions.is_empty() {
        println!("{}", "No sessions recorded yet".dimmed());
        return Ok(());
    }

    for record in &sessions {
        println!(
            "{} {:<12} {:<16} {} {}",
            util::short_id(record.id).yellow(),
            util::paint_status(record.status),
            record.mode.to_string().cyan(),
            format!("{} change(s)", record.change_ids.len()),
            util::format_relative_time(record.started_at_ms).dimmed()
        );
    }
    if journal.count() > sessions.len() {
        println!(
            "{}",
            format!("... {} older session(s)", journal.count() - sessions.len()).dimmed()
        );
    }
    Ok(())
}

/// Show one session and its changes
pub async fn run_show(global: &GlobalArgs, reference: &str) -> Result<()> {
    let config = global.load_config()?;
    let journal = util::open_journal(&config)?;

    let id = journal
        .resolve_session(reference)?
        .ok_or_else(|| anyhow::anyhow!("Session not found: {}", reference))?;
    let record = journal
        .session(id)?
        .ok_or_else(|| anyhow::anyhow!("Session not found: {}", id))?;
    let changes = journal.changes_for(&record)?;

    if global.json {
        return util::print_json(&SessionView {
            session: &record,
            changes: changes.iter().map(ChangeView::from).collect(),
        });
    }

    println!("{} {}", "session".yellow().bold(), record.id.to_string().cyan());
    println!("{} {}", "Status:    ".dimmed(), util::paint_status(record.status));
    println!("{} {}", "Mode:      ".dimmed(), record.mode);
    println!(
        "{} {} ({})",
        "Started:   ".dimmed(),
        display_time(record.started_at_ms),
        util::format_relative_time(record.started_at_ms).dimmed()
    );
    if let Some(closed) = record.closed_at_ms {
        println!("{} {}", "Closed:    ".dimmed(), display_time(closed));
    }
    println!("{} {}", "Backups:   ".dimmed(), record.backup_dir.display());
    if let Some(scope) = &record.lock_scope {
        println!("{} {}", "Lock:      ".dimmed(), scope);
    }

    println!("\n{} ({})", "Changes:".bold(), changes.len());
    for change in &changes {
        println!(
            "  {} {} {} {}",
            util::short_id(change.id).yellow(),
            change.target.id.cyan(),
            format!("[{}, {}]", change.target.kind, change.target.criticality).dimmed(),
            util::paint_state(change.state)
        );
        println!("      {}", change.target.locator.dimmed());
        if let Some(record_id) = change.backup_record_id {
            println!("      backup {}", record_id.to_string().dimmed());
        }
        if let Some(error) = &change.last_error {
            println!("      {}", error.red());
        }
    }
    Ok(())
}
