//! Orphaned location detection.
//!
//! Locations form trees. A tree is kept whole when any member is used by an
//! entity: a used leaf needs its ancestor chain and a used ancestor keeps its
//! descendants navigable. Trees with no used member are removed as a unit.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::Result;
use crate::memento::FleetSnapshot;

use super::transformer::MementoTransformer;

/// Children per location, combining explicit child lists with parent
/// pointers so a tree is the same whichever member the walk starts from.
fn child_index(snapshot: &FleetSnapshot) -> BTreeMap<&str, BTreeSet<&str>> {
    let mut index: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for location in snapshot.locations.values() {
        let entry = index.entry(location.id.as_str()).or_default();
        for child in &location.children {
            if snapshot.locations.contains_key(child) {
                entry.insert(child.as_str());
            }
        }
        if let Some(parent) = &location.parent {
            if snapshot.locations.contains_key(parent) {
                index
                    .entry(parent.as_str())
                    .or_default()
                    .insert(location.id.as_str());
            }
        }
    }
    index
}

/// The full tree containing `start`: walk the parent chain to the root, then
/// breadth-first over children from there.
fn hierarchy_of<'a>(
    snapshot: &'a FleetSnapshot,
    children: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    start: &'a str,
) -> BTreeSet<&'a str> {
    let mut ancestors = HashSet::from([start]);
    let mut root = start;
    while let Some(parent) = snapshot
        .locations
        .get(root)
        .and_then(|l| l.parent.as_deref())
        .filter(|p| snapshot.locations.contains_key(*p))
    {
        // parent loop
        if !ancestors.insert(parent) {
            break;
        }
        root = parent;
    }

    let mut members = BTreeSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        if !members.insert(id) {
            continue;
        }
        if let Some(kids) = children.get(id) {
            queue.extend(kids.iter().copied().filter(|k| !members.contains(k)));
        }
    }
    members.extend(ancestors);
    members
}

/// Ids of every location whose tree contains no location used by an entity.
pub fn find_orphaned_locations(snapshot: &FleetSnapshot) -> BTreeSet<String> {
    let referenced = snapshot.referenced_location_ids();
    let children = child_index(snapshot);
    let mut assigned: HashSet<&str> = HashSet::new();
    let mut orphaned = BTreeSet::new();

    for id in snapshot.locations.keys() {
        if assigned.contains(id.as_str()) {
            continue;
        }
        let tree = hierarchy_of(snapshot, &children, id.as_str());
        assigned.extend(tree.iter().copied());
        if !tree.iter().any(|member| referenced.contains(*member)) {
            orphaned.extend(tree.into_iter().map(str::to_string));
        }
    }
    orphaned
}

/// Offline maintenance pass that drops orphaned location trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteOrphanedLocations;

impl MementoTransformer for DeleteOrphanedLocations {
    fn name(&self) -> &'static str {
        "delete_orphaned_locations"
    }

    fn transform(&self, mut snapshot: FleetSnapshot) -> Result<FleetSnapshot> {
        let orphaned = find_orphaned_locations(&snapshot);
        if !orphaned.is_empty() {
            tracing::info!(count = orphaned.len(), "Deleting orphaned locations");
            snapshot.remove_locations(&orphaned);
        }
        Ok(snapshot)
    }
}
