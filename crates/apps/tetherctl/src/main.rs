//! tetherctl - Inspect and maintain a Tether cache from the command line
//!
//! Opens the entry store and sync queue at the configured locations and
//! runs a single maintenance command against them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Serialize;
use tether::{ConnectivityMonitor, EntryStore, SyncEngine, TetherConfig};

/// Inspect and maintain a Tether cache
#[derive(Parser, Debug)]
#[command(name = "tetherctl")]
#[command(about = "Inspect and maintain a Tether cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a config file (JSON); defaults to ~/.config/tether/tether.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe connectivity and show sync state
    Status,
    /// Show entry store statistics
    Stats,
    /// Remove expired entries
    Cleanup,
    /// Drain the sync queue now
    Sync {
        /// Sync even when the connection looks unreachable
        #[arg(short, long)]
        force: bool,
    },
    /// List queued sync operations
    Pending,
    /// List conflicts awaiting resolution
    Conflicts,
    /// Drop every queued sync operation
    ClearQueue,
    /// Monitor connectivity and auto-sync until interrupted
    Watch {
        /// Seconds between connectivity checks
        secs: Option<u64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Components {
    config: TetherConfig,
    store: Arc<EntryStore>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
}

impl Components {
    fn open(path: Option<&PathBuf>) -> Result<Self> {
        let config = match path {
            Some(path) => TetherConfig::from_file(path)?,
            None => TetherConfig::load()?,
        };
        config.validate()?;

        let cache_dir = config.cache_dir()?;
        info!("Using cache directory {}", cache_dir.display());

        let store = Arc::new(EntryStore::open_with_config(&cache_dir, &config.cache)?);
        let monitor = Arc::new(ConnectivityMonitor::new(config.connectivity.clone())?);
        let engine = Arc::new(SyncEngine::from_config(&config, store.clone(), monitor.clone())?);

        Ok(Self {
            config,
            store,
            monitor,
            engine,
        })
    }
}

fn run(cli: Cli) -> Result<()> {
    let components = Components::open(cli.config.as_ref())?;

    match cli.command {
        Command::Status => {
            components.monitor.check_now();
            print_json(&serde_json::json!({
                "connection": components.monitor.get_connection_quality(),
                "sync": components.engine.get_sync_status(),
            }))?;
        }
        Command::Stats => print_json(&components.store.get_statistics())?,
        Command::Cleanup => {
            let removed = components.store.cleanup_expired();
            println!("Removed {} expired entries", removed);
        }
        Command::Sync { force } => {
            components.monitor.check_now();
            let results = components.engine.sync_now(force);
            print_json(&results)?;
            if results.iter().any(|r| r.is_error()) {
                bail!("sync finished with errors");
            }
        }
        Command::Pending => print_json(&components.engine.get_pending_operations())?,
        Command::Conflicts => print_json(&components.engine.get_conflicts())?,
        Command::ClearQueue => {
            let dropped = components.engine.clear_queue();
            println!("Dropped {} queued operations", dropped);
        }
        Command::Watch { secs } => {
            let check = secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| components.config.connectivity.check_interval());
            components.monitor.add_observer(|event| {
                info!(
                    "Connection {} -> {} ({})",
                    event.old_status,
                    event.new_status,
                    event.error.as_deref().unwrap_or("ok")
                );
            });
            components.engine.add_callback(|result| {
                info!("Sync {:?}: {}", result.status, result.message);
            });

            components.monitor.start_monitoring(check);
            components
                .engine
                .start_auto_sync(components.config.sync.auto_sync_interval());

            loop {
                std::thread::park();
            }
        }
    }

    Ok(())
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
