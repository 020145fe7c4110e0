//! Several coordinators in one process, sharing an in-memory store.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::HaConfig;
use crate::controller::LoggingController;
use crate::error::{FleetError, Result};
use crate::ha::{HaManager, ManagementNodeState};
use crate::memento::{
    AdjunctMemento, CatalogItemMemento, EntityMemento, FleetSnapshot, Lifecycle, LocationMemento,
};
use crate::persistence::{InMemoryStore, ObjectStore, PartitionedStore};

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub nodes: usize,
    pub seconds: u64,
    pub kill_master_after: Option<u64>,
    pub ha: HaConfig,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            nodes: 3,
            seconds: 10,
            kill_master_after: None,
            ha: HaConfig {
                heartbeat_period_ms: 200,
                poll_period_ms: 200,
                detection_timeout_ms: 1000,
                ..HaConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    pub transitions: Vec<ManagementNodeState>,
    pub final_state: ManagementNodeState,
    pub highest_observed_token: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub nodes: Vec<NodeReport>,
    /// Node cut off from the store, if any
    pub killed: Option<String>,
    /// Masters seen at the end, before shutdown
    pub masters: Vec<String>,
}

struct SimNode {
    manager: HaManager,
    link: Arc<PartitionedStore>,
    transitions: Arc<Mutex<Vec<ManagementNodeState>>>,
}

/// A small fleet: two location trees, one of them unused.
pub fn demo_fleet() -> FleetSnapshot {
    let mut app = EntityMemento::new("app-1", "app.WebApplication")
        .with_child("web-1")
        .with_child("db-1")
        .with_location("us-east-1a")
        .with_state(Lifecycle::Running);
    app.catalog_item = Some("web-app:1.0".to_string());
    app.config.insert("replicas".to_string(), json!(2));

    FleetSnapshot::new()
        .with_location(LocationMemento::new("aws", "cloud").with_child("us-east-1"))
        .with_location(
            LocationMemento::new("us-east-1", "region")
                .with_parent("aws")
                .with_child("us-east-1a"),
        )
        .with_location(LocationMemento::new("us-east-1a", "zone").with_parent("us-east-1"))
        .with_location(LocationMemento::new("byon", "byon").with_child("byon-host-1"))
        .with_location(LocationMemento::new("byon-host-1", "host").with_parent("byon"))
        .with_entity(app)
        .with_entity(
            EntityMemento::new("web-1", "app.WebServer")
                .with_parent("app-1")
                .with_location("us-east-1a")
                .with_state(Lifecycle::Running),
        )
        .with_entity(
            EntityMemento::new("db-1", "app.Database")
                .with_parent("app-1")
                .with_location("us-east-1a")
                .with_state(Lifecycle::Stopped),
        )
        .with_policy(AdjunctMemento::new("autoscaler", "policy.AutoScaler", "app-1"))
        .with_enricher(AdjunctMemento::new("aggregator", "enricher.Aggregator", "app-1"))
        .with_catalog_item(CatalogItemMemento::new("web-app", "1.0", "services: [web, db]"))
}

fn masters(nodes: &[SimNode]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.manager.get_node_state() == ManagementNodeState::Master)
        .map(|n| n.manager.node_id().to_string())
        .collect()
}

/// Runs the simulation to completion and reports every node's history.
pub async fn run_simulation(options: SimulationOptions) -> Result<SimulationReport> {
    if options.nodes == 0 {
        return Err(FleetError::config("simulation needs at least one node"));
    }
    options.ha.validate()?;
    let shared: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());

    let mut nodes = Vec::with_capacity(options.nodes);
    for i in 1..=options.nodes {
        let node_id = format!("node-{}", i);
        let link = Arc::new(PartitionedStore::new(shared.clone()));
        let manager = HaManager::new(
            node_id.clone(),
            options.ha.clone(),
            link.clone(),
            Arc::new(LoggingController),
        )?;

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let mut changes = manager.state_changes();
        let recorded = transitions.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                println!("{} -> {}", node_id, state);
                recorded.lock().push(state);
            }
        });

        nodes.push(SimNode {
            manager,
            link,
            transitions,
        });
    }

    // Every node starts at once and races for the claim
    let started = join_all(nodes.iter().map(|n| n.manager.start())).await;
    for (node, result) in nodes.iter().zip(started) {
        if let Err(e) = result {
            warn!(node_id = node.manager.node_id(), error = %e, "Node failed to start");
        }
    }

    if let Some(master) = nodes
        .iter()
        .find(|n| n.manager.get_node_state() == ManagementNodeState::Master)
    {
        let manifest = master.manager.persist_snapshot(&demo_fleet()).await?;
        info!(
            node_id = master.manager.node_id(),
            generation = manifest.generation,
            "Seeded fleet snapshot"
        );
    }

    let total = Duration::from_secs(options.seconds);
    let mut killed = None;
    match options.kill_master_after.map(Duration::from_secs) {
        Some(after) if after < total => {
            sleep(after).await;
            if let Some(master) = nodes
                .iter()
                .find(|n| n.manager.get_node_state() == ManagementNodeState::Master)
            {
                println!("Cutting {} off from the store", master.manager.node_id());
                master.link.cut();
                killed = Some(master.manager.node_id().to_string());
            }
            sleep(total - after).await;
        }
        _ => sleep(total).await,
    }

    let masters = masters(&nodes);
    for result in join_all(nodes.iter().map(|n| n.manager.shutdown())).await {
        if let Err(e) = result {
            warn!(error = %e, "Shutdown failed");
        }
    }

    let nodes = nodes
        .iter()
        .map(|n| NodeReport {
            node_id: n.manager.node_id().to_string(),
            transitions: n.transitions.lock().clone(),
            final_state: n.manager.get_node_state(),
            highest_observed_token: n.manager.highest_observed_token(),
        })
        .collect();

    Ok(SimulationReport {
        nodes,
        killed,
        masters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebind::{GraphMode, RebindEngine};

    #[test]
    fn demo_fleet_has_one_orphaned_tree() {
        let outcome = RebindEngine::default()
            .rebind(demo_fleet(), GraphMode::ReadOnly)
            .unwrap();
        assert!(outcome.report.dangling.is_empty());
        assert_eq!(
            outcome.report.orphaned_locations.into_iter().collect::<Vec<_>>(),
            vec!["byon".to_string(), "byon-host-1".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_master_survives_a_short_run() {
        let report = run_simulation(SimulationOptions {
            nodes: 3,
            seconds: 1,
            ..SimulationOptions::default()
        })
        .await
        .unwrap();
        assert_eq!(report.masters.len(), 1);
        assert!(report.killed.is_none());
    }
}
