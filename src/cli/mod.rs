/*
* Operator command line
* ---------------------
* proxmigrate
* ├── locations                 // refresh and print node -> guests
* ├── migrate                   // one guest, waits for the outcome, Ctrl-C cancels
* ├── evacuate                  // plan, review, (with --yes) execute
* └── init                      // writes config/default.toml
*
* Everything runs on one cooperative runtime thread; migrations started here
* can only be cancelled from this process.
*/

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::api::{BalancerApi, GuestAction, HttpBalancerApi};
use crate::config::{generate_default_config, Settings};
use crate::core::{GuestId, GuestType, MigrationKey, MigrationStatus, MigrationTracker, TrackerConfig};
use crate::scheduler::{EvacuationOrchestrator, EvacuationSession};
use crate::utils::{output, parse_assignment};

#[derive(Parser)]
#[command(name = "proxmigrate")]
#[command(about = "Track and drive guest migrations and node evacuations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print which guest lives on which node
    Locations,
    /// Migrate one guest and wait for the outcome
    Migrate {
        #[arg(short, long)]
        guest: GuestId,
        #[arg(short, long)]
        source: String,
        #[arg(short, long)]
        target: String,
        #[arg(long, default_value = "vm")]
        guest_type: GuestType,
    },
    /// Evacuate a node
    Evacuate {
        #[arg(short, long)]
        node: String,
        /// Nodes in maintenance (defaults to the evacuated node)
        #[arg(short, long)]
        maintenance: Vec<String>,
        /// Target override, ID=NODE
        #[arg(short, long = "target", value_parser = parse_assignment::<String>)]
        targets: Vec<(GuestId, String)>,
        /// Action override, ID=migrate|ignore|poweroff
        #[arg(short, long = "action", value_parser = parse_assignment::<GuestAction>)]
        actions: Vec<(GuestId, GuestAction)>,
        /// Execute instead of stopping after review
        #[arg(short, long)]
        yes: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };
    init_logging(&settings, cli.verbose);

    let api: Arc<dyn BalancerApi> = Arc::new(HttpBalancerApi::new(
        &settings.api.base_url,
        settings.api.request_timeout(),
    )?);
    let tracker_config = TrackerConfig::from(&settings.polling);
    let tracker = MigrationTracker::new(api, tracker_config);

    match cli.command {
        Commands::Locations => {
            tracker.refresh_from_remote().await?;
            output::print_topology(&tracker.mirror());
        }
        Commands::Migrate {
            guest,
            source,
            target,
            guest_type,
        } => {
            if let Err(e) = tracker.refresh_from_remote().await {
                warn!(error = %e, "Initial refresh failed, mirror starts empty");
            }
            let refresher = tracker.spawn_periodic_refresh(Duration::from_secs(settings.refresh.interval_secs.max(1)));
            let result = handle_migrate_command(&tracker, guest, &source, &target, guest_type, tracker_config).await;
            refresher.abort();
            result?;
        }
        Commands::Evacuate {
            node,
            maintenance,
            targets,
            actions,
            yes,
        } => {
            tracker.refresh_from_remote().await?;
            handle_evacuate_command(tracker, node, maintenance, targets, actions, yes).await?;
        }
        // handled before settings are loaded
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn init_logging(settings: &Settings, verbose: u8) {
    let level = match verbose {
        0 => settings.logging.max_level(),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
}

async fn handle_migrate_command(
    tracker: &MigrationTracker,
    guest: GuestId,
    source: &str,
    target: &str,
    guest_type: GuestType,
    config: TrackerConfig,
) -> Result<()> {
    let orchestrator = EvacuationOrchestrator::new(tracker.clone());
    let key = orchestrator.migrate_guest(guest, source, target, guest_type).await?;
    println!("{} migration {} started (Ctrl-C to cancel)", "→".cyan(), key);

    let mut ticker = tokio::time::interval(config.poll_interval);
    let status = loop {
        tokio::select! {
            status = tracker.wait_terminal(&key) => break status,
            _ = ticker.tick() => {
                if let Some(record) = tracker.record(&key) {
                    println!("  {}", output::progress_line(&record));
                }
            }
            _ = tokio::signal::ctrl_c() => match tracker.cancel(&key).await {
                Ok(outcome) => break Some(outcome.status),
                Err(e) => {
                    error!(%key, error = %e, "Cancel failed");
                    println!("{} could not cancel: {}", "✗".red(), e);
                }
            },
        }
    };

    report_migration(tracker, &key, status);
    Ok(())
}

fn report_migration(tracker: &MigrationTracker, key: &MigrationKey, status: Option<MigrationStatus>) {
    let Some(status) = status else {
        println!("{} migration {} is no longer tracked", "?".magenta(), key);
        return;
    };

    println!("{} {}", key, output::status_label(status));
    match status {
        MigrationStatus::Succeeded | MigrationStatus::Cancelled => {
            if let Some(location) = tracker.guest_location(key.guest_id) {
                println!("  guest {} is on {} ({})", key.guest_id, location.node.bold(), location.status);
            }
        }
        MigrationStatus::TimedOut => {
            println!("  outcome unknown, run `proxmigrate locations` to see where the guest is");
        }
        MigrationStatus::Failed | MigrationStatus::Pending | MigrationStatus::Running => {}
    }
    if let Some(failure) = tracker.failure(key) {
        println!("  {}", failure.message.red());
    }
}

async fn handle_evacuate_command(
    tracker: MigrationTracker,
    node: String,
    maintenance: Vec<String>,
    targets: Vec<(GuestId, String)>,
    actions: Vec<(GuestId, GuestAction)>,
    execute: bool,
) -> Result<()> {
    let maintenance = if maintenance.is_empty() {
        vec![node.clone()]
    } else {
        maintenance
    };
    let orchestrator = EvacuationOrchestrator::new(tracker);
    let mut session = EvacuationSession::new(node, maintenance);

    orchestrator.request_plan(&mut session).await?;
    for (guest_id, target) in targets {
        session.set_target(guest_id, &target)?;
    }
    for (guest_id, action) in actions {
        session.set_action(guest_id, action)?;
    }
    output::print_plan(&session);

    if !execute {
        println!("{} review only, pass --yes to execute", "!".yellow());
        return Ok(());
    }

    let queued = session.confirm()?.len();
    info!(evacuation = %session.id(), queued, "Executing evacuation");
    let report = orchestrator.execute(&mut session).await?;
    output::print_report(&report);
    Ok(())
}

fn handle_init_command(force: bool) -> Result<()> {
    let config_dir = PathBuf::from("config");
    let config_file = config_dir.join("default.toml");
    if config_file.exists() && !force {
        println!("{} {} already exists. Use --force to overwrite.", "✗".red(), config_file.display());
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let config_str = toml::to_string_pretty(&generate_default_config())?;
    std::fs::write(&config_file, config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
