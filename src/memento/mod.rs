//! Memento Graph Model
//!
//! Immutable snapshot records for every modeled object type:
//! - Entities and their parent/child/location links
//! - Hierarchical locations
//! - Policies and enrichers owned by entities
//! - Catalog item definitions

mod snapshot;

pub use snapshot::{DanglingReference, FleetSnapshot, ReferenceField};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Kinds of memento stored in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MementoKind {
    Entity,
    Location,
    Policy,
    Enricher,
    CatalogItem,
}

impl MementoKind {
    pub const ALL: [MementoKind; 5] = [
        MementoKind::Entity,
        MementoKind::Location,
        MementoKind::Policy,
        MementoKind::Enricher,
        MementoKind::CatalogItem,
    ];

    /// Path segment used for this kind in the object store
    pub fn as_str(&self) -> &'static str {
        match self {
            MementoKind::Entity => "entity",
            MementoKind::Location => "location",
            MementoKind::Policy => "policy",
            MementoKind::Enricher => "enricher",
            MementoKind::CatalogItem => "catalog",
        }
    }
}

impl fmt::Display for MementoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle an entity is expected to be in when it was last written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    OnFire,
}

/// Snapshot of a single managed entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMemento {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Ordered child entity ids
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub locations: BTreeSet<String>,
    #[serde(default)]
    pub catalog_item: Option<String>,
    #[serde(default)]
    pub expected_state: Lifecycle,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl EntityMemento {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            parent: None,
            children: Vec::new(),
            locations: BTreeSet::new(),
            catalog_item: None,
            expected_state: Lifecycle::default(),
            config: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_child(mut self, child: impl Into<String>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.locations.insert(location.into());
        self
    }

    pub fn with_state(mut self, state: Lifecycle) -> Self {
        self.expected_state = state;
        self
    }
}

/// Snapshot of a location; locations form their own hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMemento {
    pub id: String,
    #[serde(rename = "type")]
    pub location_type: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

impl LocationMemento {
    pub fn new(id: impl Into<String>, location_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location_type: location_type.into(),
            parent: None,
            children: Vec::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_child(mut self, child: impl Into<String>) -> Self {
        self.children.push(child.into());
        self
    }
}

/// Snapshot of a policy or enricher attached to an entity.
///
/// Both adjunct kinds share a shape; the snapshot keeps them in separate maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjunctMemento {
    pub id: String,
    #[serde(rename = "type")]
    pub adjunct_type: String,
    pub entity: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

pub type PolicyMemento = AdjunctMemento;
pub type EnricherMemento = AdjunctMemento;

impl AdjunctMemento {
    pub fn new(
        id: impl Into<String>,
        adjunct_type: impl Into<String>,
        entity: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            adjunct_type: adjunct_type.into(),
            entity: entity.into(),
            config: BTreeMap::new(),
        }
    }
}

/// A catalog definition, identified by `symbolic_name:version`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItemMemento {
    pub symbolic_name: String,
    pub version: String,
    pub definition: String,
}

impl CatalogItemMemento {
    pub fn new(
        symbolic_name: impl Into<String>,
        version: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version: version.into(),
            definition: definition.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.symbolic_name, self.version)
    }
}
