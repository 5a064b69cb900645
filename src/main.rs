use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde::Serialize;
use serde_json::{Value, json};
use stateward::{
    config::{DataStore, load_default_settings, load_settings},
    core::Orchestrator,
    errors::Result,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Installation lifecycle and recovery manager
#[derive(Debug, Parser)]
#[command(name = "stateward", version, about)]
struct Cli {
    /// Settings file (defaults to $STATEWARD_CONFIG, then ./stateward.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the state document and a computed summary
    Status,
    /// Classify this run against the previous one
    Detect,
    /// Run the startup gate: classify, initialize state, recover, health-check
    Startup,
    /// Run the health checks
    Health,
    /// Manage backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Attempt automatic recovery
    Recover,
    /// Restore a backup (the newest if no id is given) and record the rollback
    Rollback {
        /// Backup id
        id: Option<String>,
    },
    /// Export a diagnostic archive
    Diagnostics,
    /// Wipe and rebuild the installation after an emergency backup
    Reset {
        /// Required; without it nothing is touched
        #[arg(long)]
        confirm: bool,
    },
    /// Bracket an update run
    #[command(subcommand)]
    Update(UpdateCommand),
    /// Record license activation
    Activate {
        /// License key
        license_key: String,
        /// License holder
        #[arg(long)]
        licensed_to: String,
    },
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Create a verified backup
    Create,
    /// List backups, newest first
    List,
    /// Restore a backup by id
    Restore {
        /// Backup id
        id: String,
    },
    /// Delete a backup by id
    Delete {
        /// Backup id
        id: String,
    },
    /// Keep only the newest backups
    Clean {
        /// How many to keep (defaults to the configured retention)
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Debug, Subcommand)]
enum UpdateCommand {
    /// Take a verified pre-update backup and mark an update as started
    Begin,
    /// Mark the update finished at the given version (defaults to the current one)
    Complete {
        /// Version the installation was brought to
        #[arg(long)]
        version: Option<String>,
    },
}

fn report<T: Serialize>(success: bool, value: &T) -> Result<(bool, Value)> {
    Ok((success, serde_json::to_value(value)?))
}

async fn run(cli: Cli) -> Result<(bool, Value)> {
    let settings = match &cli.config {
        Some(path) => load_settings(path)?,
        None => load_default_settings()?,
    };
    info!("Installation root: {}", settings.root.display());
    let store = Arc::new(DataStore::new(&settings));
    let orchestrator = Orchestrator::new(Arc::new(settings), store);
    let tracker = orchestrator.tracker();
    let backups = orchestrator.backups();

    let result = match cli.command {
        Command::Status => report(
            true,
            &json!({
                "state": Value::Object(tracker.load_document()),
                "summary": tracker.state_summary(),
            }),
        ),
        Command::Detect => report(true, &tracker.detect_installation_type().await),
        Command::Startup => {
            let startup = orchestrator.startup().await;
            report(!startup.blocking, &startup)
        }
        Command::Health => {
            let health = orchestrator.health().run_all_checks().await;
            report(!health.is_blocking(), &health)
        }
        Command::Backup(BackupCommand::Create) => {
            let outcome = backups.create_backup().await;
            report(outcome.success, &outcome)
        }
        Command::Backup(BackupCommand::List) => report(true, &backups.list_backups()),
        Command::Backup(BackupCommand::Restore { id }) => {
            let outcome = backups.restore_backup(&id).await;
            report(outcome.success, &outcome)
        }
        Command::Backup(BackupCommand::Delete { id }) => {
            let outcome = backups.delete_backup(&id);
            report(outcome.success, &outcome)
        }
        Command::Backup(BackupCommand::Clean { keep }) => {
            let keep = keep.unwrap_or(orchestrator.settings().backup.retention);
            let outcome = backups.clean_old_backups(keep);
            report(outcome.success, &outcome)
        }
        Command::Recover => {
            let outcome = orchestrator.attempt_auto_recovery().await;
            report(outcome.success, &outcome)
        }
        Command::Rollback { id } => {
            let outcome = orchestrator.rollback_to_last_good_state(id.as_deref()).await;
            report(outcome.success, &outcome)
        }
        Command::Diagnostics => {
            let outcome = orchestrator.export_diagnostic_bundle().await;
            report(outcome.success, &outcome)
        }
        Command::Reset { confirm } => {
            let outcome = orchestrator.reset_to_factory_defaults(confirm).await;
            report(outcome.success, &outcome)
        }
        Command::Update(UpdateCommand::Begin) => {
            let started = orchestrator.begin_update().await;
            report(started.success, &started)
        }
        Command::Update(UpdateCommand::Complete { version }) => {
            let version = version.unwrap_or_else(|| tracker.current_version());
            report(true, &tracker.complete_update(&version)?)
        }
        Command::Activate {
            license_key,
            licensed_to,
        } => report(true, &tracker.record_activation(&license_key, &licensed_to)?),
    };

    if let Err(e) = orchestrator.store().disconnect().await {
        error!("Failed to close data store connection: {}", e);
    }
    result
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // 1. Initialize tracing (stderr, so stdout stays machine-readable)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // 2. Load .env file; settings may point at it through STATEWARD_CONFIG
    dotenv().ok();

    let cli = Cli::parse();
    match run(cli).await {
        Ok((success, output)) => {
            match serde_json::to_string_pretty(&output) {
                Ok(text) => println!("{text}"),
                Err(e) => error!("Failed to render result: {}", e),
            }
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
