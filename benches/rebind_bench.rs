use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fleet_core::ha::{HaManager, HighAvailabilityMode};
use fleet_core::memento::{EntityMemento, FleetSnapshot, Lifecycle, LocationMemento};
use fleet_core::persistence::{InMemoryStore, SnapshotPersister};
use fleet_core::rebind::{find_orphaned_locations, GraphMode, RebindEngine};
use fleet_core::config::HaConfig;
use fleet_core::LoggingController;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// `regions` location trees of ten zones each; every other tree is used by
/// twenty entities.
fn fleet(regions: usize) -> FleetSnapshot {
    let mut snapshot = FleetSnapshot::new();
    for r in 0..regions {
        let region = format!("region-{}", r);
        let mut root = LocationMemento::new(region.clone(), "region");
        for z in 0..10 {
            let zone = format!("{}-zone-{}", region, z);
            root = root.with_child(zone.clone());
            snapshot = snapshot.with_location(LocationMemento::new(zone, "zone").with_parent(region.clone()));
        }
        snapshot = snapshot.with_location(root);

        if r % 2 == 0 {
            let app = format!("app-{}", r);
            let mut parent = EntityMemento::new(app.clone(), "app.Application")
                .with_state(Lifecycle::Running);
            for e in 0..20 {
                let child = format!("{}-server-{}", app, e);
                parent = parent.with_child(child.clone());
                snapshot = snapshot.with_entity(
                    EntityMemento::new(child, "app.Server")
                        .with_parent(app.clone())
                        .with_location(format!("{}-zone-{}", region, e % 10))
                        .with_state(Lifecycle::Running),
                );
            }
            snapshot = snapshot.with_entity(parent);
        }
    }
    snapshot
}

pub fn rebind_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebind");
    let snapshot = fleet(200);
    let engine = RebindEngine::default();

    group.bench_function("rebind_authoritative", |b| {
        b.iter(|| {
            black_box(
                engine
                    .rebind(snapshot.clone(), GraphMode::Authoritative)
                    .unwrap(),
            )
        })
    });

    group.bench_function("orphan_detection", |b| {
        b.iter(|| black_box(find_orphaned_locations(&snapshot)))
    });

    group.finish();
}

fn promotion_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let snapshot = fleet(50);

    c.bench_function("promotion_with_rebind", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                SnapshotPersister::new(store.clone())
                    .write(&snapshot, "bench", 0)
                    .await
                    .unwrap();
                let config = HaConfig {
                    mode: HighAvailabilityMode::Auto,
                    ..HaConfig::default()
                };
                let manager =
                    HaManager::new("bench", config, store, Arc::new(LoggingController)).unwrap();
                black_box(manager.initialize().await.unwrap());
                manager.wait_for_resumes().await
            })
        })
    });
}

criterion_group!(benches, rebind_benchmark, promotion_benchmark);
criterion_main!(benches);
