use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use overseer::config::{DaemonPaths, FileConfig, load_config};
use overseer::instance::INSTANCE_CONFIG_CATEGORY;
use overseer::registry::{InstanceRegistry, InstanceSummary, RegistryEvent, RegistrySettings};
use overseer::storage::StorageSettings;
use overseer::{InstanceConfig, InstanceStatus, Store};

#[derive(Parser)]
#[command(name = "overseerd")]
#[command(about = "Supervises long-running child processes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.overseer)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (default)
    Run,

    /// List stored instances
    List(ListArgs),
}

#[derive(Parser)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.debug);

    let paths = DaemonPaths::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&paths.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", paths.config_toml_path()))?;

    match cli.command {
        None | Some(Commands::Run) => run_daemon(paths, file_config).await,
        Some(Commands::List(args)) => list_command(paths, file_config, args.json).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "overseer=debug,process_host=debug,info"
    } else {
        "overseer=info,process_host=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn run_daemon(paths: DaemonPaths, file_config: FileConfig) -> Result<()> {
    info!("Starting overseer");

    let store = Store::connect(&StorageSettings::from_file(&file_config.storage, &paths)).await;
    let settings = RegistrySettings::from_file(&file_config.instances, &paths);
    std::fs::create_dir_all(&settings.instance_data_dir).with_context(|| {
        format!(
            "Failed to create instance data directory: {:?}",
            settings.instance_data_dir
        )
    })?;

    let registry = Arc::new(InstanceRegistry::new(store, settings));
    let event_log = tokio::spawn(log_events(registry.subscribe()));

    let loaded = registry
        .load_instances()
        .await
        .context("Failed to enumerate stored instances")?;
    let overview = registry.overview().await;
    info!(
        "{} instances loaded, {} running",
        loaded, overview.running
    );

    shutdown_signal().await;
    info!("Received shutdown signal, cleaning up...");

    let stopped = registry.exit().await;
    info!("Stopped {} instances", stopped);
    event_log.abort();
    Ok(())
}

/// Mirror lifecycle events into the daemon log
async fn log_events(mut events: tokio::sync::broadcast::Receiver<RegistryEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(RegistryEvent::Open { meta }) => {
                info!("Instance '{}' ({}) started", meta.display_name, meta.id)
            }
            Ok(RegistryEvent::Exit { meta, status }) => {
                info!(
                    "Instance '{}' ({}) exited with {}",
                    meta.display_name, meta.id, status
                )
            }
            Ok(RegistryEvent::Failure { meta, reason }) => {
                warn!(
                    "Instance '{}' ({}) failed: {}",
                    meta.display_name, meta.id, reason
                )
            }
            Ok(RegistryEvent::Data { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn list_command(paths: DaemonPaths, file_config: FileConfig, json: bool) -> Result<()> {
    let store = Store::connect(&StorageSettings::from_file(&file_config.storage, &paths)).await;

    let mut instances = Vec::new();
    for id in store.list(INSTANCE_CONFIG_CATEGORY).await? {
        match store.load::<InstanceConfig>(INSTANCE_CONFIG_CATEGORY, &id).await {
            Ok(Some(stored)) => {
                let config = InstanceConfig::from_stored(&id, stored);
                instances.push(InstanceSummary::new(&config, InstanceStatus::Stopped));
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping stored instance {}: {}", id, e),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
    } else if instances.is_empty() {
        println!("No stored instances.");
    } else {
        println!(
            "{:<34} {:<20} {:<10} {}",
            "ID", "NAME", "AUTOSTART", "WORKING DIR"
        );
        println!("{}", "-".repeat(100));
        for inst in &instances {
            println!(
                "{:<34} {:<20} {:<10} {}",
                inst.id,
                inst.display_name,
                if inst.auto_start { "yes" } else { "no" },
                inst.working_dir.display()
            );
        }
        println!("\n{} instance(s)", instances.len());
    }

    Ok(())
}
