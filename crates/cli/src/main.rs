//! Rampart CLI - rampart command

use anyhow::Result;
use clap::{Parser, Subcommand};
use rampart_cli::cmd;
use rampart_cli::logging;
use rampart_cli::util::GlobalArgs;
use rampart_journal::ExecutionMode;
use std::path::PathBuf;

/// Rampart - transactional configuration changes for server hardening
#[derive(Parser)]
#[command(name = "rampart")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $RAMPART_CONFIG, /etc/rampart/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a plan of changes in one session
    Apply {
        /// Plan file listing targets and their new content
        #[arg(long)]
        plan: PathBuf,
        /// interactive, non-interactive or dry-run
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Seconds to wait for another run to finish
        #[arg(long)]
        lock_timeout: Option<u64>,
        /// Lock scope guarding the host
        #[arg(long, default_value = "host")]
        scope: String,
    },
    /// Manage restore points
    #[command(subcommand)]
    RestorePoint(RestorePointCommands),
    /// Remove expired session backups
    Cleanup {
        /// Override the configured retention
        #[arg(long)]
        retention_days: Option<u64>,
    },
    /// List recent sessions
    Sessions {
        /// Number of sessions to show (default: 20)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one session and its changes
    Session {
        /// Session ID or unique prefix
        id: String,
    },
    /// Show who holds the host lock
    Lock {
        #[arg(long, default_value = "host")]
        scope: String,
    },
    /// View and edit configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum RestorePointCommands {
    /// Snapshot every target of a plan
    Create {
        /// Name, e.g. before-caprover
        name: String,
        /// Plan whose targets are captured
        #[arg(long)]
        plan: PathBuf,
        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List restore points
    List,
    /// Put every target of a restore point back
    Restore {
        /// Restore point ID or name (newest wins)
        id: String,
        /// Plan providing hooks for non-file targets
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Delete a restore point
    Delete {
        /// Restore point ID or name
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List all configuration values
    List,
    /// Print one value
    Get { key: String },
    /// Change one value
    Set { key: String, value: String },
    /// Show the config file path
    Path {
        /// Write a default config if none exists
        #[arg(long)]
        create: bool,
    },
    /// Print a commented example configuration
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let global = GlobalArgs {
        config: cli.config,
        json: cli.json,
    };

    // An unreadable config is reported by the command itself
    let _log_guard = logging::init(&global.load_config().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Apply {
            plan,
            mode,
            lock_timeout,
            scope,
        } => {
            let args = cmd::apply::ApplyArgs {
                plan,
                mode,
                lock_timeout_secs: lock_timeout,
                scope,
            };
            cmd::apply::run(&global, args).await
        }
        Commands::RestorePoint(point_cmd) => match point_cmd {
            RestorePointCommands::Create {
                name,
                plan,
                description,
            } => cmd::restore_point::run_create(&global, &name, &plan, description).await,
            RestorePointCommands::List => cmd::restore_point::run_list(&global).await,
            RestorePointCommands::Restore { id, plan, yes } => {
                cmd::restore_point::run_restore(&global, &id, plan.as_deref(), yes).await
            }
            RestorePointCommands::Delete { id } => {
                cmd::restore_point::run_delete(&global, &id).await
            }
        },
        Commands::Cleanup { retention_days } => cmd::cleanup::run(&global, retention_days).await,
        Commands::Sessions { limit } => cmd::sessions::run_list(&global, limit).await,
        Commands::Session { id } => cmd::sessions::run_show(&global, &id).await,
        Commands::Lock { scope } => cmd::lock::run(&global, &scope).await,
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::List => cmd::config::run_list(&global).await,
            ConfigCommands::Get { key } => cmd::config::run_get(&global, &key).await,
            ConfigCommands::Set { key, value } => {
                cmd::config::run_set(&global, &key, &value).await
            }
            ConfigCommands::Path { create } => cmd::config::run_path(&global, create).await,
            ConfigCommands::Example => cmd::config::run_example().await,
        },
    }
}
