use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{keys, ObjectStore};
use crate::error::{FleetError, Result};
use crate::memento::{FleetSnapshot, MementoKind};

/// Manifest races a single write tolerates before giving up
const MAX_MANIFEST_RACES: usize = 8;

/// Pointer to the latest complete snapshot. Members of every snapshot live
/// under their own `snapshot_id` and are never rewritten, so a reader holding
/// a manifest sees exactly that generation until it is reclaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub generation: u64,
    pub snapshot_id: String,
    pub written_by: String,
    pub written_at: DateTime<Utc>,
    pub fencing_token: u64,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub enrichers: Vec<String>,
    #[serde(default)]
    pub catalog_items: Vec<String>,
    #[serde(default)]
    pub top_level_entities: Vec<String>,
    #[serde(default)]
    pub top_level_locations: Vec<String>,
}

impl SnapshotManifest {
    fn members(&self, kind: MementoKind) -> &[String] {
        match kind {
            MementoKind::Entity => &self.entities,
            MementoKind::Location => &self.locations,
            MementoKind::Policy => &self.policies,
            MementoKind::Enricher => &self.enrichers,
            MementoKind::CatalogItem => &self.catalog_items,
        }
    }
}

/// Snapshot ids sort by generation first
fn snapshot_id(generation: u64) -> String {
    format!("{:020}-{}", generation, Uuid::new_v4().simple())
}

fn generation_of(snapshot_id: &str) -> Option<u64> {
    snapshot_id.split_once('-')?.0.parse().ok()
}

/// Per-object problems found while loading; none of them abort the load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Generation of the manifest that was followed, 0 when none exists
    pub generation: u64,
    pub problems: Vec<FleetError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Reads and writes fleet snapshots as one object per memento plus a manifest.
///
/// The committed snapshot and the one before it are kept; older ones are
/// deleted once a newer manifest is in place.
#[derive(Clone)]
pub struct SnapshotPersister {
    store: Arc<dyn ObjectStore>,
}

impl SnapshotPersister {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Writes every memento under a fresh snapshot id, then commits the
    /// manifest for the next generation with a conditional write.
    ///
    /// Fails with [`FleetError::StaleClaimLost`] when the stored manifest was
    /// written under a higher fencing token than `fencing_token`.
    pub async fn write(
        &self,
        snapshot: &FleetSnapshot,
        writer: &str,
        fencing_token: u64,
    ) -> Result<SnapshotManifest> {
        for _ in 0..MAX_MANIFEST_RACES {
            let (current, version) = self.read_manifest_versioned().await?;
            if let Some(current) = &current {
                if current.fencing_token > fencing_token {
                    warn!(
                        writer,
                        fencing_token,
                        stored_token = current.fencing_token,
                        stored_by = %current.written_by,
                        "Refusing snapshot write from a superseded token"
                    );
                    return Err(FleetError::StaleClaimLost {
                        winner: current.written_by.clone(),
                        token: current.fencing_token,
                    });
                }
            }

            let generation = current.as_ref().map_or(1, |m| m.generation + 1);
            let id = snapshot_id(generation);
            self.put_members(&id, snapshot).await?;

            let manifest = SnapshotManifest {
                generation,
                snapshot_id: id.clone(),
                written_by: writer.to_string(),
                written_at: Utc::now(),
                fencing_token,
                entities: snapshot.ids(MementoKind::Entity),
                locations: snapshot.ids(MementoKind::Location),
                policies: snapshot.ids(MementoKind::Policy),
                enrichers: snapshot.ids(MementoKind::Enricher),
                catalog_items: snapshot.ids(MementoKind::CatalogItem),
                top_level_entities: snapshot.top_level_entities.clone(),
                top_level_locations: snapshot.top_level_locations.clone(),
            };
            if self
                .store
                .put_if_version_matches(keys::MANIFEST, serde_json::to_vec(&manifest)?, version)
                .await?
            {
                debug!(generation, members = snapshot.len(), "Wrote fleet snapshot");
                self.reclaim(&manifest, current.as_ref()).await;
                return Ok(manifest);
            }

            debug!(generation, "Manifest moved while writing snapshot, retrying");
            self.delete_snapshot(&id).await;
        }
        Err(FleetError::StoreUnavailable(format!(
            "lost {} consecutive races on {}",
            MAX_MANIFEST_RACES,
            keys::MANIFEST
        )))
    }

    pub async fn read_manifest(&self) -> Result<Option<SnapshotManifest>> {
        match self.store.get(keys::MANIFEST).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw.value)
                .map(Some)
                .map_err(|e| FleetError::CorruptManifest(e.to_string())),
        }
    }

    /// The manifest with the version it was read at. A corrupt manifest
    /// reads as absent so the next write replaces it.
    async fn read_manifest_versioned(&self) -> Result<(Option<SnapshotManifest>, Option<u64>)> {
        match self.store.get(keys::MANIFEST).await? {
            None => Ok((None, None)),
            Some(raw) => match serde_json::from_slice(&raw.value) {
                Ok(manifest) => Ok((Some(manifest), Some(raw.version))),
                Err(e) => {
                    warn!(error = %e, "Overwriting corrupt snapshot manifest");
                    Ok((None, Some(raw.version)))
                }
            },
        }
    }

    /// Loads the snapshot the current manifest points at.
    pub async fn load(&self) -> Result<(FleetSnapshot, LoadReport)> {
        match self.read_manifest().await? {
            Some(manifest) => self.load_generation(&manifest).await,
            None => Ok((FleetSnapshot::default(), LoadReport::default())),
        }
    }

    /// Loads the snapshot a given manifest points at. Members that are
    /// missing or fail to deserialize are left out and reported.
    pub async fn load_generation(
        &self,
        manifest: &SnapshotManifest,
    ) -> Result<(FleetSnapshot, LoadReport)> {
        let mut report = LoadReport {
            generation: manifest.generation,
            problems: Vec::new(),
        };
        let mut snapshot = FleetSnapshot {
            top_level_entities: manifest.top_level_entities.clone(),
            top_level_locations: manifest.top_level_locations.clone(),
            ..FleetSnapshot::default()
        };

        snapshot.entities = self
            .load_members(manifest, MementoKind::Entity, &mut report)
            .await?;
        snapshot.locations = self
            .load_members(manifest, MementoKind::Location, &mut report)
            .await?;
        snapshot.policies = self
            .load_members(manifest, MementoKind::Policy, &mut report)
            .await?;
        snapshot.enrichers = self
            .load_members(manifest, MementoKind::Enricher, &mut report)
            .await?;
        snapshot.catalog_items = self
            .load_members(manifest, MementoKind::CatalogItem, &mut report)
            .await?;

        Ok((snapshot, report))
    }

    async fn put_members(&self, id: &str, snapshot: &FleetSnapshot) -> Result<()> {
        for (member, entity) in &snapshot.entities {
            self.put_member(id, MementoKind::Entity, member, entity).await?;
        }
        for (member, location) in &snapshot.locations {
            self.put_member(id, MementoKind::Location, member, location).await?;
        }
        for (member, policy) in &snapshot.policies {
            self.put_member(id, MementoKind::Policy, member, policy).await?;
        }
        for (member, enricher) in &snapshot.enrichers {
            self.put_member(id, MementoKind::Enricher, member, enricher).await?;
        }
        for (member, item) in &snapshot.catalog_items {
            self.put_member(id, MementoKind::CatalogItem, member, item).await?;
        }
        Ok(())
    }

    /// Members are written once under a new key; a leftover from an
    /// abandoned attempt with the same id cannot exist.
    async fn put_member<T: Serialize>(
        &self,
        snapshot_id: &str,
        kind: MementoKind,
        id: &str,
        value: &T,
    ) -> Result<()> {
        let key = keys::memento(snapshot_id, kind, id);
        let bytes = serde_json::to_vec(value)?;
        if !self.store.put_if_version_matches(&key, bytes, None).await? {
            return Err(FleetError::internal(format!("snapshot member {} already exists", key)));
        }
        Ok(())
    }

    /// Deletes every snapshot at or below the committed generation except
    /// the committed one and its predecessor. Failures only leave garbage
    /// behind for the next write to collect.
    async fn reclaim(&self, committed: &SnapshotManifest, previous: Option<&SnapshotManifest>) {
        let keep: BTreeSet<&str> = std::iter::once(committed.snapshot_id.as_str())
            .chain(previous.map(|m| m.snapshot_id.as_str()))
            .collect();
        let listed = match self.store.list_by_prefix(keys::SNAPSHOT_PREFIX).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Could not list snapshots to reclaim");
                return;
            }
        };

        let mut removed = 0usize;
        for key in listed {
            let Some(id) = keys::snapshot_of(&key) else {
                continue;
            };
            let superseded = generation_of(id).is_some_and(|g| g <= committed.generation);
            if !superseded || keep.contains(id) {
                continue;
            }
            match self.store.delete(&key).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(%key, error = %e, "Could not delete superseded snapshot member");
                    return;
                }
            }
        }
        if removed > 0 {
            info!(
                generation = committed.generation,
                removed, "Reclaimed superseded snapshot members"
            );
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) {
        let prefix = keys::snapshot(snapshot_id);
        let listed = match self.store.list_by_prefix(&prefix).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(%prefix, error = %e, "Could not list abandoned snapshot");
                return;
            }
        };
        for key in listed {
            if let Err(e) = self.store.delete(&key).await {
                warn!(%key, error = %e, "Could not delete abandoned snapshot member");
                return;
            }
        }
    }

    async fn load_members<T: DeserializeOwned>(
        &self,
        manifest: &SnapshotManifest,
        kind: MementoKind,
        report: &mut LoadReport,
    ) -> Result<BTreeMap<String, T>> {
        let mut members = BTreeMap::new();
        for id in manifest.members(kind) {
            let key = keys::memento(&manifest.snapshot_id, kind, id);
            let Some(raw) = self.store.get(&key).await? else {
                warn!(%key, "Manifest member missing from store");
                report.problems.push(FleetError::CorruptMemento {
                    key,
                    reason: "missing".into(),
                });
                continue;
            };
            match serde_json::from_slice::<T>(&raw.value) {
                Ok(memento) => {
                    members.insert(id.clone(), memento);
                }
                Err(e) => {
                    warn!(%key, error = %e, "Skipping memento that failed to deserialize");
                    report.problems.push(FleetError::CorruptMemento {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(members)
    }
}
