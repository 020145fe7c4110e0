//! Rebind and orphan handling over stored snapshots.

mod common;

use common::{sample_fleet, TestCluster};
use fleet_core::ha::{HighAvailabilityMode, ManagementNodeState};
use fleet_core::memento::{EntityMemento, FleetSnapshot, LocationMemento};
use fleet_core::persistence::{keys, put_overwrite, SnapshotPersister};
use fleet_core::rebind::{
    find_orphaned_locations, DeleteOrphanedLocations, GraphMode, MementoTransformer, RebindEngine,
    RebindOptions, TransformerKind, TransformerPipeline,
};
use fleet_core::memento::MementoKind;
use fleet_core::FleetError;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Random location forest: location `i` may hang under any `j < i`.
/// Entities each use one random location.
fn forest() -> impl Strategy<Value = (Vec<Option<usize>>, Vec<usize>)> {
    (1..12usize).prop_flat_map(|n| {
        let parents = (0..n)
            .map(|i| {
                if i == 0 {
                    Just(None).boxed()
                } else {
                    prop::option::of(0..i).boxed()
                }
            })
            .collect::<Vec<_>>();
        (parents, prop::collection::vec(0..n, 0..4))
    })
}

fn build(parents: &[Option<usize>], used: &[usize]) -> FleetSnapshot {
    let mut locations: Vec<LocationMemento> = (0..parents.len())
        .map(|i| LocationMemento::new(format!("l{}", i), "zone"))
        .collect();
    for (i, parent) in parents.iter().enumerate() {
        if let Some(p) = parent {
            locations[i].parent = Some(format!("l{}", p));
            locations[*p].children.push(format!("l{}", i));
        }
    }
    let mut snapshot = locations
        .into_iter()
        .fold(FleetSnapshot::new(), |s, l| s.with_location(l));
    for (n, loc) in used.iter().enumerate() {
        snapshot = snapshot.with_entity(
            EntityMemento::new(format!("e{}", n), "app.Server").with_location(format!("l{}", loc)),
        );
    }
    snapshot
}

fn root_of(parents: &[Option<usize>], mut i: usize) -> usize {
    while let Some(p) = parents[i] {
        i = p;
    }
    i
}

proptest! {
    #[test]
    fn trees_are_orphaned_whole_or_not_at_all((parents, used) in forest()) {
        let snapshot = build(&parents, &used);
        let orphaned = find_orphaned_locations(&snapshot);

        let mut trees: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..parents.len() {
            trees.entry(root_of(&parents, i)).or_default().push(i);
        }
        let used_roots: BTreeSet<usize> = used.iter().map(|&l| root_of(&parents, l)).collect();

        for (root, members) in trees {
            let expect_orphaned = !used_roots.contains(&root);
            for member in members {
                prop_assert_eq!(orphaned.contains(&format!("l{}", member)), expect_orphaned);
            }
        }
    }

    #[test]
    fn rebind_and_pruning_are_idempotent((parents, used) in forest()) {
        let snapshot = build(&parents, &used);
        let engine = RebindEngine::default();
        let first = engine.rebind(snapshot.clone(), GraphMode::ReadOnly).unwrap();
        let second = engine.rebind(snapshot.clone(), GraphMode::ReadOnly).unwrap();
        prop_assert_eq!(&first.graph, &second.graph);

        let once = DeleteOrphanedLocations.transform(snapshot).unwrap();
        let twice = DeleteOrphanedLocations.transform(once.clone()).unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert!(find_orphaned_locations(&once).is_empty());
        prop_assert!(once.dangling_references().is_empty());
    }
}

#[test]
fn referencing_one_member_saves_the_whole_tree() {
    // R with descendants D1, D2
    let tree = FleetSnapshot::new()
        .with_location(LocationMemento::new("r", "cloud").with_child("d1").with_child("d2"))
        .with_location(LocationMemento::new("d1", "region").with_parent("r"))
        .with_location(LocationMemento::new("d2", "region").with_parent("r"));

    let pruned = DeleteOrphanedLocations.transform(tree.clone()).unwrap();
    assert!(pruned.locations.is_empty());
    assert!(pruned.top_level_locations.is_empty());

    let referenced = tree.with_entity(EntityMemento::new("e", "app.Server").with_location("d2"));
    let kept = DeleteOrphanedLocations.transform(referenced).unwrap();
    assert_eq!(kept.locations.len(), 3);
}

#[test]
fn pruning_rebind_leaves_orphans_out_of_graph() {
    let snapshot = sample_fleet().with_location(LocationMemento::new("spare", "byon"));
    let engine = RebindEngine::new(
        RebindOptions {
            prune_orphaned_locations: true,
        },
        TransformerPipeline::new(),
    );
    let outcome = engine.rebind(snapshot, GraphMode::Authoritative).unwrap();
    assert!(outcome.report.pruned);
    assert!(outcome.report.orphaned_locations.contains("spare"));
    assert!(outcome.graph.location("spare").is_none());
    assert!(outcome.graph.location("l1").is_some());
}

#[test]
fn configured_pipeline_runs_before_rebind() {
    let snapshot = sample_fleet().with_location(LocationMemento::new("spare", "byon"));
    let engine = RebindEngine::new(
        RebindOptions::default(),
        TransformerPipeline::from_kinds(&[TransformerKind::DeleteOrphanedLocations]),
    );
    let outcome = engine.rebind(snapshot, GraphMode::ReadOnly).unwrap();
    assert!(outcome.report.transformer_rejection.is_none());
    assert!(outcome.graph.location("spare").is_none());
    assert!(outcome.report.orphaned_locations.is_empty());
}

#[tokio::test]
async fn corrupt_member_is_excluded_and_reported() {
    let cluster = TestCluster::new();
    cluster.seed(&sample_fleet()).await;
    let key = cluster.member_key(MementoKind::Entity, "e2").await;
    put_overwrite(cluster.store.as_ref(), &key, b"{not json".to_vec())
        .await
        .unwrap();

    let persister = SnapshotPersister::new(cluster.store.clone());
    let (snapshot, report) = persister.load().await.unwrap();
    assert_eq!(report.generation, 1);
    assert!(!report.is_clean());
    assert!(matches!(
        &report.problems[0],
        FleetError::CorruptMemento { key: k, .. } if k == &key
    ));
    assert!(snapshot.entities.contains_key("e1"));
    assert!(!snapshot.entities.contains_key("e2"));

    // e1 still lists e2 as a child: reported, the edge is dropped
    let outcome = RebindEngine::default()
        .rebind(snapshot, GraphMode::Authoritative)
        .unwrap();
    assert_eq!(outcome.report.dangling.len(), 1);
    assert!(outcome.graph.entity("e1").unwrap().children.is_empty());
}

#[tokio::test]
async fn promotion_survives_corrupt_member() {
    let mut cluster = TestCluster::new();
    cluster.seed(&sample_fleet()).await;
    let key = cluster.member_key(MementoKind::Entity, "e2").await;
    put_overwrite(cluster.store.as_ref(), &key, b"garbage".to_vec())
        .await
        .unwrap();

    let a = cluster.add("a", HighAvailabilityMode::Auto);
    assert_eq!(a.initialize().await.unwrap(), ManagementNodeState::Master);
    let resumed = a.wait_for_resumes().await;
    assert_eq!(resumed.len(), 1);
    assert_eq!(cluster.node("a").controller.resumed(), vec!["e1".to_string()]);
}

#[tokio::test]
async fn corrupt_manifest_aborts_promotion() {
    let mut cluster = TestCluster::new();
    put_overwrite(cluster.store.as_ref(), keys::MANIFEST, b"{not json".to_vec())
        .await
        .unwrap();

    let persister = SnapshotPersister::new(cluster.store.clone());
    assert!(matches!(
        persister.load().await,
        Err(FleetError::CorruptManifest(_))
    ));

    let a = cluster.add("a", HighAvailabilityMode::Auto);
    assert_eq!(a.initialize().await.unwrap(), ManagementNodeState::Standby);
    assert_eq!(a.fencing_token(), None);
    let claim = cluster.claim().await.unwrap();
    assert_eq!(claim.timestamp, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
}

#[tokio::test]
async fn master_write_is_readable_by_a_fresh_persister() {
    let mut cluster = TestCluster::new();
    let a = cluster.add("a", HighAvailabilityMode::Auto);
    a.initialize().await.unwrap();
    let written = a.persist_snapshot(&sample_fleet()).await.unwrap();
    assert_eq!(written.written_by, "a");

    let (snapshot, report) = SnapshotPersister::new(cluster.store.clone())
        .load()
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(snapshot, sample_fleet());
    assert_eq!(a.live_graph().unwrap().to_snapshot(), sample_fleet());
}

#[tokio::test]
async fn reader_holding_a_manifest_sees_only_that_generation() {
    let mut cluster = TestCluster::new();
    let a = cluster.add("a", HighAvailabilityMode::Auto);
    a.initialize().await.unwrap();
    a.persist_snapshot(&sample_fleet()).await.unwrap();

    let reader = SnapshotPersister::new(cluster.store.clone());
    let held = reader.read_manifest().await.unwrap().unwrap();

    // e1 moves to a location that only exists from generation 2 on
    let mut moved = sample_fleet().with_location(LocationMemento::new("l-new", "zone"));
    moved.entities.get_mut("e1").unwrap().locations = ["l-new".to_string()].into();
    a.persist_snapshot(&moved).await.unwrap();

    let (snapshot, report) = reader.load_generation(&held).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(snapshot, sample_fleet());
    let outcome = RebindEngine::default()
        .rebind(snapshot, GraphMode::ReadOnly)
        .unwrap();
    assert!(outcome.report.dangling.is_empty());

    assert_eq!(reader.load().await.unwrap().0, moved);
}
