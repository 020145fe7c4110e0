//! Persistence Adapter
//!
//! The minimal contract this control plane requires of the shared object
//! store. The store is the only synchronization point between management
//! nodes:
//! - One heartbeat object per node
//! - One singleton master-claim object
//! - One object per memento, grouped per snapshot, plus a manifest naming the
//!   latest complete snapshot

mod memory;
mod partition;
mod snapshot;

pub use memory::InMemoryStore;
pub use partition::PartitionedStore;
pub use snapshot::{LoadReport, SnapshotManifest, SnapshotPersister};

use async_trait::async_trait;
use thiserror::Error;

use crate::memento::MementoKind;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Object store shared by all management nodes.
///
/// `put_if_version_matches` is the only write primitive: `expected` of `None`
/// means the key must not exist yet. Implementations bump the version on
/// every successful write. `delete` is only used to reclaim superseded
/// snapshots and succeeds for absent keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    async fn put_if_version_matches(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<bool, StoreError>;

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Key layout inside the store
pub mod keys {
    use super::MementoKind;

    pub const HEARTBEAT_PREFIX: &str = "ha/heartbeat/";
    pub const MASTER_CLAIM: &str = "ha/master-claim";
    pub const MANIFEST: &str = "fleet/manifest";
    pub const SNAPSHOT_PREFIX: &str = "fleet/snapshots/";

    pub fn heartbeat(node_id: &str) -> String {
        format!("{}{}", HEARTBEAT_PREFIX, node_id)
    }

    /// Every member of one snapshot lives under this prefix
    pub fn snapshot(snapshot_id: &str) -> String {
        format!("{}{}/", SNAPSHOT_PREFIX, snapshot_id)
    }

    pub fn memento(snapshot_id: &str, kind: MementoKind, id: &str) -> String {
        format!("{}{}/{}", snapshot(snapshot_id), kind.as_str(), id)
    }

    /// Snapshot id a member key belongs to
    pub fn snapshot_of(key: &str) -> Option<&str> {
        key.strip_prefix(SNAPSHOT_PREFIX)?.split('/').next()
    }
}

/// Writes `value` regardless of the current version, retrying if another
/// writer slips in between the read and the write.
pub async fn put_overwrite(
    store: &dyn ObjectStore,
    key: &str,
    value: Vec<u8>,
) -> Result<(), StoreError> {
    const MAX_RACES: usize = 8;
    for _ in 0..MAX_RACES {
        let expected = store.get(key).await?.map(|v| v.version);
        if store
            .put_if_version_matches(key, value.clone(), expected)
            .await?
        {
            return Ok(());
        }
    }
    Err(StoreError::Unavailable(format!(
        "lost {} consecutive write races on {}",
        MAX_RACES, key
    )))
}
