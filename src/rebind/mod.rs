//! Rebind Engine
//!
//! Turns a [`FleetSnapshot`] into a [`LiveGraph`]:
//! - Skeleton phase: one placeholder per memento, no links
//! - Resolution phase: parent/child/location links by id lookup
//! - Attachment phase: policies, enrichers and catalog items
//! - Orphan detection over location trees
//!
//! The engine is synchronous and holds no state between calls, so hot
//! mirrors and promoting masters run exactly the same code.

pub mod orphans;
pub mod transformer;

pub use orphans::{find_orphaned_locations, DeleteOrphanedLocations};
pub use transformer::{MementoTransformer, PipelineOutcome, TransformerKind, TransformerPipeline};

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::error::{FleetError, Result};
use crate::memento::{
    CatalogItemMemento, DanglingReference, FleetSnapshot, Lifecycle, MementoKind, ReferenceField,
};

/// Whether the graph may be mutated by its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GraphMode {
    /// Mirror kept by hot standby / hot backup nodes
    ReadOnly,
    /// The master's graph
    Authoritative,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveAdjunct {
    pub id: String,
    pub adjunct_type: String,
    pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEntity {
    pub id: String,
    pub entity_type: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub locations: BTreeSet<String>,
    pub catalog_item: Option<String>,
    pub expected_state: Lifecycle,
    pub config: BTreeMap<String, Value>,
    pub attributes: BTreeMap<String, Value>,
    pub policies: Vec<LiveAdjunct>,
    pub enrichers: Vec<LiveAdjunct>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveLocation {
    pub id: String,
    pub location_type: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub config: BTreeMap<String, Value>,
    /// Member of a location tree no entity uses
    pub orphaned: bool,
}

/// The in-memory fleet reconstructed from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveGraph {
    pub mode: GraphMode,
    pub entities: BTreeMap<String, LiveEntity>,
    pub locations: BTreeMap<String, LiveLocation>,
    pub catalog: BTreeMap<String, CatalogItemMemento>,
    pub top_level_entities: Vec<String>,
    pub top_level_locations: Vec<String>,
}

impl LiveGraph {
    pub fn entity(&self, id: &str) -> Option<&LiveEntity> {
        self.entities.get(id)
    }

    pub fn location(&self, id: &str) -> Option<&LiveLocation> {
        self.locations.get(id)
    }

    pub fn is_authoritative(&self) -> bool {
        self.mode == GraphMode::Authoritative
    }

    /// Entities that were running when the snapshot was written
    pub fn running_entities(&self) -> impl Iterator<Item = &LiveEntity> {
        self.entities
            .values()
            .filter(|e| e.expected_state == Lifecycle::Running)
    }

    /// Converts the graph back into mementos, e.g. for the master to persist.
    pub fn to_snapshot(&self) -> FleetSnapshot {
        use crate::memento::{AdjunctMemento, EntityMemento, LocationMemento};

        let mut snapshot = FleetSnapshot {
            top_level_entities: self.top_level_entities.clone(),
            top_level_locations: self.top_level_locations.clone(),
            catalog_items: self.catalog.clone(),
            ..FleetSnapshot::default()
        };
        for entity in self.entities.values() {
            snapshot.entities.insert(
                entity.id.clone(),
                EntityMemento {
                    id: entity.id.clone(),
                    entity_type: entity.entity_type.clone(),
                    parent: entity.parent.clone(),
                    children: entity.children.clone(),
                    locations: entity.locations.clone(),
                    catalog_item: entity.catalog_item.clone(),
                    expected_state: entity.expected_state,
                    config: entity.config.clone(),
                    attributes: entity.attributes.clone(),
                },
            );
            for (adjuncts, target) in [
                (&entity.policies, &mut snapshot.policies),
                (&entity.enrichers, &mut snapshot.enrichers),
            ] {
                for adjunct in adjuncts {
                    target.insert(
                        adjunct.id.clone(),
                        AdjunctMemento {
                            id: adjunct.id.clone(),
                            adjunct_type: adjunct.adjunct_type.clone(),
                            entity: entity.id.clone(),
                            config: adjunct.config.clone(),
                        },
                    );
                }
            }
        }
        for location in self.locations.values() {
            snapshot.locations.insert(
                location.id.clone(),
                LocationMemento {
                    id: location.id.clone(),
                    location_type: location.location_type.clone(),
                    parent: location.parent.clone(),
                    children: location.children.clone(),
                    config: location.config.clone(),
                },
            );
        }
        snapshot
    }
}

/// What the engine found while rebuilding
#[derive(Debug, Clone, Default)]
pub struct RebindReport {
    pub dangling: Vec<DanglingReference>,
    pub orphaned_locations: BTreeSet<String>,
    /// Whether orphaned locations were left out of the graph
    pub pruned: bool,
    pub transformer_rejection: Option<FleetError>,
}

#[derive(Debug, Clone)]
pub struct RebindOutcome {
    pub graph: LiveGraph,
    pub report: RebindReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RebindOptions {
    pub prune_orphaned_locations: bool,
}

#[derive(Clone, Default)]
pub struct RebindEngine {
    options: RebindOptions,
    pipeline: TransformerPipeline,
}

impl RebindEngine {
    pub fn new(options: RebindOptions, pipeline: TransformerPipeline) -> Self {
        Self { options, pipeline }
    }

    /// Rebuilds a graph. Fails only on structural corruption; per-object
    /// problems are reported and the affected edge is dropped.
    pub fn rebind(&self, snapshot: FleetSnapshot, mode: GraphMode) -> Result<RebindOutcome> {
        let PipelineOutcome {
            snapshot,
            rejected,
        } = self.pipeline.apply(snapshot);
        check_structure(&snapshot)?;

        let mut report = RebindReport {
            transformer_rejection: rejected,
            ..RebindReport::default()
        };

        let mut graph = skeleton(&snapshot, mode);
        resolve(&snapshot, &mut graph, &mut report.dangling);
        attach(&snapshot, &mut graph, &mut report.dangling);

        report.orphaned_locations = find_orphaned_locations(&snapshot);
        if self.options.prune_orphaned_locations {
            for id in &report.orphaned_locations {
                graph.locations.remove(id);
            }
            graph
                .top_level_locations
                .retain(|id| !report.orphaned_locations.contains(id));
            report.pruned = true;
        } else {
            for id in &report.orphaned_locations {
                if let Some(location) = graph.locations.get_mut(id) {
                    location.orphaned = true;
                }
            }
        }

        report.dangling.sort();
        report.dangling.dedup();
        for dangling in &report.dangling {
            warn!(reference = %dangling, "Dropped dangling reference during rebind");
        }
        debug!(
            entities = graph.entities.len(),
            locations = graph.locations.len(),
            orphaned = report.orphaned_locations.len(),
            ?mode,
            "Rebind complete"
        );
        Ok(RebindOutcome { graph, report })
    }
}

/// Rejects snapshots whose maps are keyed inconsistently or whose entity
/// parent chains loop; either means the manifest itself is corrupt.
fn check_structure(snapshot: &FleetSnapshot) -> Result<()> {
    for (key, entity) in &snapshot.entities {
        if key != &entity.id {
            return Err(FleetError::RebindFailed(format!(
                "entity stored under {} claims id {}",
                key, entity.id
            )));
        }
    }
    for (key, location) in &snapshot.locations {
        if key != &location.id {
            return Err(FleetError::RebindFailed(format!(
                "location stored under {} claims id {}",
                key, location.id
            )));
        }
    }
    for (key, item) in &snapshot.catalog_items {
        if key != &item.id() {
            return Err(FleetError::RebindFailed(format!(
                "catalog item stored under {} claims id {}",
                key,
                item.id()
            )));
        }
    }

    let mut acyclic: HashSet<&str> = HashSet::new();
    for start in snapshot.entities.keys() {
        let mut chain = HashSet::new();
        let mut cursor = Some(start.as_str());
        while let Some(id) = cursor {
            if acyclic.contains(id) {
                break;
            }
            if !chain.insert(id) {
                return Err(FleetError::RebindFailed(format!(
                    "entity parent chain loops at {}",
                    id
                )));
            }
            cursor = snapshot
                .entities
                .get(id)
                .and_then(|e| e.parent.as_deref());
        }
        acyclic.extend(chain);
    }
    Ok(())
}

fn skeleton(snapshot: &FleetSnapshot, mode: GraphMode) -> LiveGraph {
    let entities = snapshot
        .entities
        .values()
        .map(|m| {
            (
                m.id.clone(),
                LiveEntity {
                    id: m.id.clone(),
                    entity_type: m.entity_type.clone(),
                    parent: None,
                    children: Vec::new(),
                    locations: BTreeSet::new(),
                    catalog_item: None,
                    expected_state: m.expected_state,
                    config: m.config.clone(),
                    attributes: m.attributes.clone(),
                    policies: Vec::new(),
                    enrichers: Vec::new(),
                },
            )
        })
        .collect();
    let locations = snapshot
        .locations
        .values()
        .map(|m| {
            (
                m.id.clone(),
                LiveLocation {
                    id: m.id.clone(),
                    location_type: m.location_type.clone(),
                    parent: None,
                    children: Vec::new(),
                    config: m.config.clone(),
                    orphaned: false,
                },
            )
        })
        .collect();

    LiveGraph {
        mode,
        entities,
        locations,
        catalog: BTreeMap::new(),
        top_level_entities: Vec::new(),
        top_level_locations: Vec::new(),
    }
}

fn dangling(kind: MementoKind, from: &str, field: ReferenceField, target: &str) -> DanglingReference {
    DanglingReference {
        kind,
        from: from.to_string(),
        field,
        target: target.to_string(),
    }
}

fn resolve(snapshot: &FleetSnapshot, graph: &mut LiveGraph, report: &mut Vec<DanglingReference>) {
    let entity_ids: HashSet<&str> = snapshot.entities.keys().map(String::as_str).collect();
    let location_ids: HashSet<&str> = snapshot.locations.keys().map(String::as_str).collect();

    for memento in snapshot.entities.values() {
        let id = memento.id.as_str();
        let mut parent = None;
        if let Some(p) = &memento.parent {
            if entity_ids.contains(p.as_str()) {
                parent = Some(p.clone());
            } else {
                report.push(dangling(MementoKind::Entity, id, ReferenceField::Parent, p));
            }
        }
        let mut children = Vec::with_capacity(memento.children.len());
        for child in &memento.children {
            if entity_ids.contains(child.as_str()) {
                if !children.contains(child) {
                    children.push(child.clone());
                }
            } else {
                report.push(dangling(MementoKind::Entity, id, ReferenceField::Child, child));
            }
        }
        let mut locations = BTreeSet::new();
        for location in &memento.locations {
            if location_ids.contains(location.as_str()) {
                locations.insert(location.clone());
            } else {
                report.push(dangling(MementoKind::Entity, id, ReferenceField::Location, location));
            }
        }

        if let Some(live) = graph.entities.get_mut(id) {
            live.parent = parent;
            live.children = children;
            live.locations = locations;
        }
    }

    for memento in snapshot.locations.values() {
        let id = memento.id.as_str();
        let mut parent = None;
        if let Some(p) = &memento.parent {
            if location_ids.contains(p.as_str()) {
                parent = Some(p.clone());
            } else {
                report.push(dangling(MementoKind::Location, id, ReferenceField::Parent, p));
            }
        }
        let mut children = Vec::with_capacity(memento.children.len());
        for child in &memento.children {
            if location_ids.contains(child.as_str()) {
                if !children.contains(child) {
                    children.push(child.clone());
                }
            } else {
                report.push(dangling(MementoKind::Location, id, ReferenceField::Child, child));
            }
        }
        if let Some(live) = graph.locations.get_mut(id) {
            live.parent = parent;
            live.children = children;
        }
    }

    // Back-references: a child naming a parent is listed by that parent
    let entity_links: Vec<(String, String)> = graph
        .entities
        .values()
        .filter_map(|e| e.parent.clone().map(|p| (p, e.id.clone())))
        .collect();
    for (parent, child) in entity_links {
        if let Some(p) = graph.entities.get_mut(&parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
    }
    let location_links: Vec<(String, String)> = graph
        .locations
        .values()
        .filter_map(|l| l.parent.clone().map(|p| (p, l.id.clone())))
        .collect();
    for (parent, child) in location_links {
        if let Some(p) = graph.locations.get_mut(&parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
    }

    for id in &snapshot.top_level_entities {
        if entity_ids.contains(id.as_str()) {
            graph.top_level_entities.push(id.clone());
        } else {
            report.push(dangling(MementoKind::Entity, "", ReferenceField::TopLevel, id));
        }
    }
    for id in &snapshot.top_level_locations {
        if location_ids.contains(id.as_str()) {
            graph.top_level_locations.push(id.clone());
        } else {
            report.push(dangling(MementoKind::Location, "", ReferenceField::TopLevel, id));
        }
    }
}

fn attach(snapshot: &FleetSnapshot, graph: &mut LiveGraph, report: &mut Vec<DanglingReference>) {
    graph.catalog = snapshot.catalog_items.clone();

    for memento in snapshot.entities.values() {
        if let Some(item) = &memento.catalog_item {
            if graph.catalog.contains_key(item) {
                if let Some(live) = graph.entities.get_mut(&memento.id) {
                    live.catalog_item = Some(item.clone());
                }
            } else {
                report.push(dangling(
                    MementoKind::Entity,
                    &memento.id,
                    ReferenceField::CatalogItem,
                    item,
                ));
            }
        }
    }

    for (kind, adjuncts) in [
        (MementoKind::Policy, &snapshot.policies),
        (MementoKind::Enricher, &snapshot.enrichers),
    ] {
        for adjunct in adjuncts.values() {
            let Some(owner) = graph.entities.get_mut(&adjunct.entity) else {
                report.push(dangling(kind, &adjunct.id, ReferenceField::Owner, &adjunct.entity));
                continue;
            };
            let live = LiveAdjunct {
                id: adjunct.id.clone(),
                adjunct_type: adjunct.adjunct_type.clone(),
                config: adjunct.config.clone(),
            };
            match kind {
                MementoKind::Policy => owner.policies.push(live),
                _ => owner.enrichers.push(live),
            }
        }
    }
}
