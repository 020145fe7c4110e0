use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::{
    CatalogItemMemento, EnricherMemento, EntityMemento, LocationMemento, MementoKind,
    PolicyMemento,
};

/// Which edge of a memento a reference came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceField {
    Parent,
    Child,
    Location,
    Owner,
    CatalogItem,
    TopLevel,
}

/// An id referenced by a memento that does not resolve within the snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DanglingReference {
    pub kind: MementoKind,
    /// Id of the referencing memento; empty for manifest-level top-level lists
    pub from: String,
    pub field: ReferenceField,
    pub target: String,
}

impl fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} -> {}",
            self.kind, self.from, self.field, self.target
        )
    }
}

/// Every memento of the fleet at one point in time
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    #[serde(default)]
    pub entities: BTreeMap<String, EntityMemento>,
    #[serde(default)]
    pub locations: BTreeMap<String, LocationMemento>,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyMemento>,
    #[serde(default)]
    pub enrichers: BTreeMap<String, EnricherMemento>,
    #[serde(default)]
    pub catalog_items: BTreeMap<String, CatalogItemMemento>,
    #[serde(default)]
    pub top_level_entities: Vec<String>,
    #[serde(default)]
    pub top_level_locations: Vec<String>,
}

impl FleetSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity; parentless entities are recorded as top-level.
    pub fn with_entity(mut self, entity: EntityMemento) -> Self {
        if entity.parent.is_none() && !self.top_level_entities.contains(&entity.id) {
            self.top_level_entities.push(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
        self
    }

    /// Adds a location; parentless locations are recorded as top-level.
    pub fn with_location(mut self, location: LocationMemento) -> Self {
        if location.parent.is_none() && !self.top_level_locations.contains(&location.id) {
            self.top_level_locations.push(location.id.clone());
        }
        self.locations.insert(location.id.clone(), location);
        self
    }

    pub fn with_policy(mut self, policy: PolicyMemento) -> Self {
        self.policies.insert(policy.id.clone(), policy);
        self
    }

    pub fn with_enricher(mut self, enricher: EnricherMemento) -> Self {
        self.enrichers.insert(enricher.id.clone(), enricher);
        self
    }

    pub fn with_catalog_item(mut self, item: CatalogItemMemento) -> Self {
        self.catalog_items.insert(item.id(), item);
        self
    }

    pub fn len(&self) -> usize {
        self.entities.len()
            + self.locations.len()
            + self.policies.len()
            + self.enrichers.len()
            + self.catalog_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of one kind, in storage order
    pub fn ids(&self, kind: MementoKind) -> Vec<String> {
        match kind {
            MementoKind::Entity => self.entities.keys().cloned().collect(),
            MementoKind::Location => self.locations.keys().cloned().collect(),
            MementoKind::Policy => self.policies.keys().cloned().collect(),
            MementoKind::Enricher => self.enrichers.keys().cloned().collect(),
            MementoKind::CatalogItem => self.catalog_items.keys().cloned().collect(),
        }
    }

    /// Location ids directly used by at least one entity
    pub fn referenced_location_ids(&self) -> BTreeSet<String> {
        self.entities
            .values()
            .flat_map(|e| e.locations.iter().cloned())
            .collect()
    }

    /// Removes the given locations along with any top-level or child entries
    /// naming them.
    pub fn remove_locations(&mut self, ids: &BTreeSet<String>) {
        for id in ids {
            self.locations.remove(id);
        }
        self.top_level_locations.retain(|id| !ids.contains(id));
        for location in self.locations.values_mut() {
            location.children.retain(|c| !ids.contains(c));
        }
    }

    /// Every reference in the snapshot that does not resolve, sorted.
    pub fn dangling_references(&self) -> Vec<DanglingReference> {
        let mut dangling = BTreeSet::new();
        let mut check = |exists: bool, kind, from: &str, field, target: &str| {
            if !exists {
                dangling.insert(DanglingReference {
                    kind,
                    from: from.to_string(),
                    field,
                    target: target.to_string(),
                });
            }
        };

        for entity in self.entities.values() {
            if let Some(parent) = &entity.parent {
                check(
                    self.entities.contains_key(parent),
                    MementoKind::Entity,
                    &entity.id,
                    ReferenceField::Parent,
                    parent,
                );
            }
            for child in &entity.children {
                check(
                    self.entities.contains_key(child),
                    MementoKind::Entity,
                    &entity.id,
                    ReferenceField::Child,
                    child,
                );
            }
            for location in &entity.locations {
                check(
                    self.locations.contains_key(location),
                    MementoKind::Entity,
                    &entity.id,
                    ReferenceField::Location,
                    location,
                );
            }
            if let Some(item) = &entity.catalog_item {
                check(
                    self.catalog_items.contains_key(item),
                    MementoKind::Entity,
                    &entity.id,
                    ReferenceField::CatalogItem,
                    item,
                );
            }
        }

        for location in self.locations.values() {
            if let Some(parent) = &location.parent {
                check(
                    self.locations.contains_key(parent),
                    MementoKind::Location,
                    &location.id,
                    ReferenceField::Parent,
                    parent,
                );
            }
            for child in &location.children {
                check(
                    self.locations.contains_key(child),
                    MementoKind::Location,
                    &location.id,
                    ReferenceField::Child,
                    child,
                );
            }
        }

        for (kind, adjuncts) in [
            (MementoKind::Policy, &self.policies),
            (MementoKind::Enricher, &self.enrichers),
        ] {
            for adjunct in adjuncts.values() {
                check(
                    self.entities.contains_key(&adjunct.entity),
                    kind,
                    &adjunct.id,
                    ReferenceField::Owner,
                    &adjunct.entity,
                );
            }
        }

        for id in &self.top_level_entities {
            check(
                self.entities.contains_key(id),
                MementoKind::Entity,
                "",
                ReferenceField::TopLevel,
                id,
            );
        }
        for id in &self.top_level_locations {
            check(
                self.locations.contains_key(id),
                MementoKind::Location,
                "",
                ReferenceField::TopLevel,
                id,
            );
        }

        dangling.into_iter().collect()
    }
}
