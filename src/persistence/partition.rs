use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{ObjectStore, StoreError, Versioned};

/// One node's view of a shared store. Cutting the link makes every call from
/// this node fail while other nodes keep working, as in a network partition.
pub struct PartitionedStore {
    inner: Arc<dyn ObjectStore>,
    cut: AtomicBool,
    rejected: AtomicU64,
}

impl PartitionedStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            cut: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn cut(&self) {
        debug!("Store link cut");
        self.cut.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        debug!("Store link healed");
        self.cut.store(false, Ordering::SeqCst);
    }

    pub fn is_cut(&self) -> bool {
        self.cut.load(Ordering::SeqCst)
    }

    /// Calls refused while the link was cut
    pub fn rejected_calls(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    fn link(&self) -> Result<&dyn ObjectStore, StoreError> {
        if self.is_cut() {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("link to store is cut".into()));
        }
        Ok(self.inner.as_ref())
    }
}

#[async_trait]
impl ObjectStore for PartitionedStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.link()?.get(key).await
    }

    async fn put_if_version_matches(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.link()?.put_if_version_matches(key, value, expected).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.link()?.list_by_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.link()?.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    #[tokio::test]
    async fn cut_link_fails_only_this_view() {
        let shared: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let a = PartitionedStore::new(shared.clone());
        let b = PartitionedStore::new(shared.clone());

        assert!(a.put_if_version_matches("k", b"1".to_vec(), None).await.unwrap());
        a.cut();
        assert!(matches!(a.get("k").await, Err(StoreError::Unavailable(_))));
        assert_eq!(b.get("k").await.unwrap().unwrap().value, b"1".to_vec());
        assert_eq!(a.rejected_calls(), 1);

        a.heal();
        assert_eq!(a.list_by_prefix("").await.unwrap(), vec!["k".to_string()]);
    }
}
