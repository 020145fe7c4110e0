//! Common test utilities for fleet-core tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use fleet_core::config::HaConfig;
use fleet_core::controller::EntityController;
use fleet_core::ha::{HaManager, HighAvailabilityMode, MasterClaimRecord, MockClock, RetryPolicy};
use fleet_core::memento::{EntityMemento, FleetSnapshot, Lifecycle, LocationMemento, MementoKind};
use fleet_core::persistence::{
    keys, InMemoryStore, ObjectStore, PartitionedStore, SnapshotPersister, StoreError, Versioned,
};
use fleet_core::rebind::LiveEntity;
use fleet_core::Result;

/// Timing used by every test node: 100ms heartbeats, 500ms detection.
pub fn fast_ha(mode: HighAvailabilityMode) -> HaConfig {
    HaConfig {
        mode,
        heartbeat_period_ms: 100,
        poll_period_ms: 40,
        detection_timeout_ms: 500,
        publish_retry: RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            jitter: false,
        },
    }
}

/// Longer than the detection timeout of [`fast_ha`].
pub const PAST_DETECTION: Duration = Duration::from_millis(600);

/// Holds conditional writes to one key until opened, so tests can line up
/// races deterministically. Can also fail a number of claim reads.
pub struct GatedStore {
    inner: Arc<dyn ObjectStore>,
    held_key: Mutex<Option<&'static str>>,
    claim_read_failures: AtomicU32,
    entered: Notify,
    release: Notify,
}

#[allow(dead_code)]
impl GatedStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            held_key: Mutex::new(None),
            claim_read_failures: AtomicU32::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn hold_claim_writes(&self) {
        self.hold_writes_to(keys::MASTER_CLAIM);
    }

    pub fn hold_writes_to(&self, key: &'static str) {
        *self.held_key.lock() = Some(key);
    }

    /// Waits until a write is parked at the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        *self.held_key.lock() = None;
        self.release.notify_waiters();
    }

    /// The next `n` reads of the master claim fail as a store outage.
    pub fn fail_claim_reads(&self, n: u32) {
        self.claim_read_failures.store(n, Ordering::SeqCst);
    }

    pub fn claim_read_failures_left(&self) -> u32 {
        self.claim_read_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<Versioned>, StoreError> {
        if key == keys::MASTER_CLAIM
            && self
                .claim_read_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("injected claim read failure".into()));
        }
        self.inner.get(key).await
    }

    async fn put_if_version_matches(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> std::result::Result<bool, StoreError> {
        let held = *self.held_key.lock() == Some(key);
        if held {
            let released = self.release.notified();
            self.entered.notify_one();
            released.await;
        }
        self.inner.put_if_version_matches(key, value, expected).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        self.inner.list_by_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Records every call; optionally never finishes a resume.
#[derive(Default)]
pub struct RecordingController {
    pub resumed: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    block_resumes: bool,
}

#[allow(dead_code)]
impl RecordingController {
    pub fn blocking() -> Self {
        Self {
            block_resumes: true,
            ..Self::default()
        }
    }

    pub fn resumed(&self) -> Vec<String> {
        let mut ids = self.resumed.lock().clone();
        ids.sort();
        ids
    }
}

#[async_trait]
impl EntityController for RecordingController {
    async fn resume(&self, entity: &LiveEntity) -> Result<()> {
        self.resumed.lock().push(entity.id.clone());
        if self.block_resumes {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn stop(&self, entity_id: &str) -> Result<()> {
        self.stopped.lock().push(entity_id.to_string());
        Ok(())
    }
}

#[allow(dead_code)]
pub struct TestNode {
    pub manager: HaManager,
    pub link: Arc<PartitionedStore>,
    pub gate: Arc<GatedStore>,
    pub controller: Arc<RecordingController>,
}

/// Several coordinators sharing one store and one mock clock. Loops are not
/// spawned; tests drive ticks explicitly.
pub struct TestCluster {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<MockClock>,
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid start time");
        Self {
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(MockClock::at(start)),
            nodes: Vec::new(),
        }
    }

    pub fn add(&mut self, id: &str, mode: HighAvailabilityMode) -> HaManager {
        self.add_with(id, mode, RecordingController::default())
    }

    pub fn add_with(
        &mut self,
        id: &str,
        mode: HighAvailabilityMode,
        controller: RecordingController,
    ) -> HaManager {
        let gate = Arc::new(GatedStore::new(self.store.clone()));
        let link = Arc::new(PartitionedStore::new(gate.clone()));
        let controller = Arc::new(controller);
        let manager = HaManager::new(id, fast_ha(mode), link.clone(), controller.clone())
            .expect("valid HA config")
            .with_clock(self.clock.clone());
        self.nodes.push(TestNode {
            manager: manager.clone(),
            link,
            gate,
            controller,
        });
        manager
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.manager.node_id() == id)
            .expect("unknown test node")
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// One heartbeat and one poll on every node, in order.
    pub async fn tick(&self) {
        for node in &self.nodes {
            let _ = node.manager.heartbeat_tick().await;
            let _ = node.manager.poll_tick().await;
        }
    }

    pub fn masters(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.manager.get_node_state() == fleet_core::ManagementNodeState::Master)
            .map(|n| n.manager.node_id().to_string())
            .collect()
    }

    /// Claim currently in the store
    pub async fn claim(&self) -> Option<MasterClaimRecord> {
        let raw = self.store.get(keys::MASTER_CLAIM).await.expect("store up")?;
        Some(serde_json::from_slice(&raw.value).expect("valid claim"))
    }

    /// Writes a claim as if some other node had won it.
    pub async fn write_claim(&self, node_id: &str, token: u64, fresh: bool) {
        let timestamp = if fresh {
            fleet_core::ha::Clock::now(self.clock.as_ref())
        } else {
            chrono::DateTime::<Utc>::UNIX_EPOCH
        };
        let claim = MasterClaimRecord::new(node_id, token, timestamp);
        let version = self
            .store
            .get(keys::MASTER_CLAIM)
            .await
            .expect("store up")
            .map(|v| v.version);
        let written = self
            .store
            .put_if_version_matches(
                keys::MASTER_CLAIM,
                serde_json::to_vec(&claim).expect("serializable"),
                version,
            )
            .await
            .expect("store up");
        assert!(written);
    }

    /// Store key of a member of the committed snapshot
    pub async fn member_key(&self, kind: MementoKind, id: &str) -> String {
        let manifest = SnapshotPersister::new(self.store.clone())
            .read_manifest()
            .await
            .expect("readable manifest")
            .expect("committed snapshot");
        keys::memento(&manifest.snapshot_id, kind, id)
    }

    pub async fn seed(&self, snapshot: &FleetSnapshot) {
        SnapshotPersister::new(self.store.clone())
            .write(snapshot, "seed", 0)
            .await
            .expect("seed snapshot");
    }
}

/// The two-entity, two-location fleet: e2 under e1, l2 under l1.
#[allow(dead_code)]
pub fn sample_fleet() -> FleetSnapshot {
    FleetSnapshot::new()
        .with_location(LocationMemento::new("l1", "region").with_child("l2"))
        .with_location(LocationMemento::new("l2", "zone").with_parent("l1"))
        .with_entity(
            EntityMemento::new("e1", "app.Application")
                .with_child("e2")
                .with_location("l1")
                .with_state(Lifecycle::Running),
        )
        .with_entity(
            EntityMemento::new("e2", "app.Server")
                .with_parent("e1")
                .with_location("l2")
                .with_state(Lifecycle::Running),
        )
}
