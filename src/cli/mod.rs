//! CLI for the fleet control plane
//!
//! Provides command-line interface functionality for:
//! - Running a coordinator node
//! - Simulating a cluster of coordinators sharing one store
//! - Offline rebind and orphaned-location maintenance on snapshot files
//! - Writing and checking configuration files

mod simulate;

use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::controller::LoggingController;
use crate::error::{FleetError, Result};
use crate::ha::HaManager;
use crate::memento::FleetSnapshot;
use crate::persistence::InMemoryStore;
use crate::rebind::{GraphMode, RebindEngine, RebindOptions, TransformerKind, TransformerPipeline};

pub use simulate::{run_simulation, SimulationOptions, SimulationReport};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; the default search path is used when absent
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one coordinator node until Ctrl+C
    Run {
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Run several coordinators against one shared in-memory store
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Cut the master off from the store after this many seconds
        #[arg(long)]
        kill_master_after: Option<u64>,
    },
    /// Rebind a snapshot file and print what was found
    Rebind {
        snapshot: PathBuf,
        /// Leave orphaned locations out of the graph
        #[arg(long)]
        prune: bool,
    },
    /// Remove orphaned location hierarchies from a snapshot file
    Prune {
        snapshot: PathBuf,
        /// Where to write the result; stdout when absent
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default configuration
    Init { path: Option<PathBuf> },
    /// Load and validate a configuration
    Check { path: Option<PathBuf> },
}

/// Loads the configuration named on the command line, or discovers one.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::discover(),
    }
}

pub fn read_snapshot(path: &Path) -> Result<FleetSnapshot> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Runs a single node against an in-process store until `shutdown` fires.
pub async fn run_node(
    config: &Config,
    node_id: Option<String>,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| config.node_id());
    let store = Arc::new(InMemoryStore::new());
    let engine = RebindEngine::new(
        config.rebind.options(),
        TransformerPipeline::from_kinds(&config.rebind.transformers),
    );
    let manager = HaManager::new(node_id.clone(), config.ha.clone(), store, Arc::new(LoggingController))?
        .with_engine(engine);

    let state = manager.start().await?;
    println!("Node {} started as {}", node_id, state);

    let mut changes = manager.state_changes();
    tokio::select! {
        _ = shutdown => {
            info!("Shutdown requested");
        }
        _ = async {
            while changes.changed().await.is_ok() {
                println!("Node {} is now {}", node_id, *changes.borrow());
            }
        } => {}
    }

    manager.shutdown().await?;
    println!("Node {} stopped as {}", node_id, manager.get_node_state());
    Ok(())
}

/// Offline rebind of a snapshot file, returning the printed report.
pub fn rebind_report(snapshot: FleetSnapshot, config: &Config, prune: bool) -> Result<serde_json::Value> {
    let options = RebindOptions {
        prune_orphaned_locations: prune || config.rebind.prune_orphaned_locations,
    };
    let engine = RebindEngine::new(
        options,
        TransformerPipeline::from_kinds(&config.rebind.transformers),
    );
    let outcome = engine.rebind(snapshot, GraphMode::ReadOnly)?;
    let report = outcome.report;

    Ok(json!({
        "entities": outcome.graph.entities.len(),
        "locations": outcome.graph.locations.len(),
        "running": outcome.graph.running_entities().count(),
        "dangling": report.dangling.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        "orphaned_locations": report.orphaned_locations,
        "pruned": report.pruned,
        "transformer_rejection": report.transformer_rejection.map(|e| e.to_string()),
    }))
}

/// Runs the orphan-deleting transformer over a snapshot. The pipeline fails
/// closed, so a rejection is an error here rather than a silent no-op.
pub fn prune_snapshot(snapshot: FleetSnapshot) -> Result<FleetSnapshot> {
    let before = snapshot.locations.len();
    let outcome =
        TransformerPipeline::from_kinds(&[TransformerKind::DeleteOrphanedLocations]).apply(snapshot);
    if let Some(rejected) = outcome.rejected {
        return Err(rejected);
    }
    debug!(
        removed = before - outcome.snapshot.locations.len(),
        "Pruned orphaned locations"
    );
    Ok(outcome.snapshot)
}

pub fn config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path } => {
            let path = path.clone().unwrap_or_else(|| PathBuf::from("fleet.yml"));
            if path.exists() {
                return Err(FleetError::config(format!(
                    "{} already exists",
                    path.display()
                )));
            }
            Config::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigAction::Check { path } => {
            let config = load_config(path.as_deref())?;
            println!("Configuration OK");
            println!("{}", serde_yaml::to_string(&config)?);
        }
    }
    Ok(())
}

/// Executes every command except `run`, which main wires to Ctrl+C.
pub async fn execute(config: &Config, command: &Commands) -> Result<()> {
    match command {
        Commands::Run { .. } => Err(FleetError::internal("run is driven by main")),
        Commands::Simulate {
            nodes,
            seconds,
            kill_master_after,
        } => {
            let options = SimulationOptions {
                nodes: *nodes,
                seconds: *seconds,
                kill_master_after: *kill_master_after,
                ..SimulationOptions::default()
            };
            let report = run_simulation(options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Rebind { snapshot, prune } => {
            let report = rebind_report(read_snapshot(snapshot)?, config, *prune)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Prune { snapshot, output } => {
            let pruned = prune_snapshot(read_snapshot(snapshot)?)?;
            let rendered = serde_json::to_string_pretty(&pruned)?;
            match output {
                Some(path) => {
                    fs::write(path, rendered)?;
                    println!("Wrote pruned snapshot to {}", path.display());
                }
                None => println!("{}", rendered),
            }
            Ok(())
        }
        Commands::Config { action } => config_command(action),
    }
}
