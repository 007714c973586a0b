//! Run a plan through one session

use crate::plan::Plan;
use crate::prompt::PromptGate;
use crate::util::{self, GlobalArgs};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use rampart_journal::{
    AbortSignal, ChangeState, EngineSettings, ExecutionMode, SessionManager, SessionReport,
    SessionStatus,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// The previous holder closes its journal just after releasing the lock
const JOURNAL_GRACE: Duration = Duration::from_secs(5);

pub struct ApplyArgs {
    pub plan: PathBuf,
    pub mode: Option<ExecutionMode>,
    pub lock_timeout_secs: Option<u64>,
    pub scope: String,
}

pub async fn run(global: &GlobalArgs, args: ApplyArgs) -> Result<()> {
    let config = global.load_config()?;
    let plan = Plan::load(&args.plan)?;
    let mode = match args.mode.or(plan.mode()?) {
        Some(mode) => mode,
        None if std::io::stdin().is_terminal() => ExecutionMode::Interactive,
        None => ExecutionMode::NonInteractive,
    };
    let changes = plan.changes()?;
    if changes.is_empty() {
        println!("{}", "Plan has no targets - nothing to do".dimmed());
        return Ok(());
    }

    let adapters = plan.adapters(tokio::runtime::Handle::current(), config.hook_timeout());
    let store = util::open_store(&config)?;
    let gate = (mode == ExecutionMode::Interactive).then(PromptGate::stdin);

    // Ctrl-C finishes the change in flight, then rolls the session back
    let abort = AbortSignal::new();
    let interrupt = tokio::spawn({
        let abort = abort.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, rolling back once the current change settles");
                abort.trip();
            }
        }
    });

    let locks = util::lock_manager(&config);
    let lock_timeout = args
        .lock_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.lock_timeout());
    let scope = args.scope;

    let outcome = tokio::task::spawn_blocking(move || -> Result<SessionReport> {
        // The journal is exclusive to one process, so it is only opened
        // once the host lock is ours
        let started = Instant::now();
        let lock = locks.acquire(&scope, lock_timeout)?;
        let journal_wait = lock_timeout
            .saturating_sub(started.elapsed())
            .max(JOURNAL_GRACE);
        let journal = util::open_journal_wait(&config, journal_wait)?;

        let mut manager = SessionManager::new(
            store,
            adapters,
            journal,
            EngineSettings::from_config(&config),
        )
        .with_abort_signal(abort);
        if let Some(gate) = gate {
            manager = manager.with_gate(Box::new(gate));
        }

        let mut session = manager.open_guarded(mode, lock)?;
        tracing::info!(session = %session.id(), "Running {} change(s)", changes.len());
        Ok(session.execute(changes)?)
    })
    .await
    .context("Session task failed")?;
    interrupt.abort();

    let report = outcome?;
    if global.json {
        util::print_json(&report)?;
    } else {
        print_report(&report);
    }

    if report.status != SessionStatus::Committed {
        anyhow::bail!(
            "Session {} ended {}",
            util::short_id(report.session_id),
            report.status
        );
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!(
        "{} {} {}",
        "Session".bold(),
        report.session_id.to_string().yellow(),
        format!("({})", report.mode).dimmed()
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if report.mode == ExecutionMode::DryRun {
        for outcome in &report.dry_run {
            println!();
            let verdict = match &outcome.validation_error {
                None => "✓ valid".green().to_string(),
                Some(e) => format!("✗ {e}").red().to_string(),
            };
            println!("{}  {}", outcome.target_id.cyan(), verdict);
            if outcome.would_change() {
                for line in outcome.diff.lines() {
                    if line.starts_with('+') && !line.starts_with("+++") {
                        println!("  {}", line.green());
                    } else if line.starts_with('-') && !line.starts_with("---") {
                        println!("  {}", line.red());
                    } else {
                        println!("  {}", line.dimmed());
                    }
                }
            } else {
                println!("  {}", "(no change)".dimmed());
            }
        }
    } else {
        println!();
        for change in &report.changes {
            let marker = match change.state {
                ChangeState::Committed => "✓".green().to_string(),
                ChangeState::RolledBack => "↺".yellow().to_string(),
                _ => "✗".red().to_string(),
            };
            print!(
                "{} {:<24} {}",
                marker,
                change.target_id.cyan(),
                util::paint_state(change.state)
            );
            match &change.error {
                Some(e) => println!("  {}", e.dimmed()),
                None => println!(),
            }
        }
    }

    if !report.warnings.is_empty() {
        println!();
        println!("{}", "Warnings:".yellow().bold());
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
    }

    println!();
    println!("Status:  {}", util::paint_status(report.status));
}
