use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

use super::{ObjectStore, StoreError, Versioned};

/// Process-local store with the same conditional-write semantics a shared
/// store must provide. Used by the CLI demos and by tests that run several
/// coordinators in one process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<String, Versioned>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every operation fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.ensure_available()?;
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn put_if_version_matches(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut objects = self.objects.lock();
        let current = objects.get(key).map(|v| v.version);
        if current != expected {
            trace!(key, ?current, ?expected, "Conditional write rejected");
            return Ok(false);
        }
        let version = current.unwrap_or(0) + 1;
        objects.insert(key.to_string(), Versioned { value, version });
        Ok(true)
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .objects
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.objects.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_write_requires_matching_version() {
        let store = InMemoryStore::new();
        assert!(store.put_if_version_matches("k", vec![1], None).await.unwrap());
        assert!(!store.put_if_version_matches("k", vec![2], None).await.unwrap());
        assert!(store.put_if_version_matches("k", vec![3], Some(1)).await.unwrap());
        assert!(!store.put_if_version_matches("k", vec![4], Some(1)).await.unwrap());

        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, vec![3]);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn lists_only_matching_prefix() {
        let store = InMemoryStore::new();
        for key in ["ha/heartbeat/a", "ha/heartbeat/b", "ha/master-claim", "fleet/manifest"] {
            store.put_if_version_matches(key, vec![], None).await.unwrap();
        }
        let keys = store.list_by_prefix("ha/heartbeat/").await.unwrap();
        assert_eq!(keys, vec!["ha/heartbeat/a", "ha/heartbeat/b"]);
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.put_if_version_matches("k", vec![], None).await.is_err());
        assert!(store.delete("k").await.is_err());
        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_and_tolerates_absent_keys() {
        let store = InMemoryStore::new();
        store.put_if_version_matches("k", vec![1], None).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
        // A recreated key starts over
        assert!(store.put_if_version_matches("k", vec![2], None).await.unwrap());
    }
}
