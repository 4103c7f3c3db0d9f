//! In-memory object store for testing.

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectInfo, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// An in-memory object store.
///
/// This store keeps all objects in memory and is suitable for:
/// - Unit tests
/// - Integration tests of the agent pipeline
///
/// Failures can be injected: uploads can be rejected a number of times or
/// made to hang until the caller gives up.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across tasks.
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use walvault_storage::{InMemoryStore, ObjectStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = InMemoryStore::new();
/// store.fail_next_uploads(1);
/// assert!(store.upload("a", Bytes::new()).await.is_err());
/// assert!(store.upload("a", Bytes::new()).await.is_ok());
/// assert_eq!(store.len(), 1);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    failing_uploads: AtomicUsize,
    stalled: AtomicBool,
    uploads: AtomicUsize,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given objects.
    pub fn with_objects<I, N>(objects: I) -> Self
    where
        I: IntoIterator<Item = (N, Bytes)>,
        N: Into<String>,
    {
        let store = Self::new();
        {
            let mut map = store.objects.write();
            for (name, data) in objects {
                map.insert(name.into(), data);
            }
        }
        store
    }

    /// Rejects the next `count` uploads.
    pub fn fail_next_uploads(&self, count: usize) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    /// Makes uploads hang forever while `stalled` is set.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Returns the number of successful uploads so far.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Returns the stored bytes for `name`, bypassing the trait.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.objects.read().get(name).cloned()
    }

    /// Replaces the stored bytes for `name`, bypassing the trait.
    pub fn put_raw(&self, name: impl Into<String>, data: Bytes) {
        self.objects.write().insert(name.into(), data);
    }

    /// Returns all object names in lexicographic order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Returns the number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failing_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn upload(&self, name: &str, data: Bytes) -> StoreResult<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.take_failure() {
            return Err(StoreError::UploadRejected {
                name: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.objects.write().insert(name.to_string(), data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(&self, name: &str) -> StoreResult<Bytes> {
        self.get(name).ok_or_else(|| StoreError::not_found(name))
    }

    async fn list(&self) -> StoreResult<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .read()
            .iter()
            .map(|(name, data)| ObjectInfo::new(name.clone(), data.len() as u64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_new_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_upload_then_download() {
        let store = InMemoryStore::new();
        store.upload("x", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(store.download("x").await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(store.upload_count(), 1);
    }

    #[tokio::test]
    async fn memory_upload_replaces() {
        let store = InMemoryStore::new();
        store.upload("x", Bytes::from_static(b"one")).await.unwrap();
        store.upload("x", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("x").unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn memory_missing_is_not_found() {
        let store = InMemoryStore::new();
        assert!(store.download("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn memory_list_reports_sizes() {
        let store = InMemoryStore::with_objects([
            ("a", Bytes::from_static(b"12")),
            ("b", Bytes::from_static(b"12345")),
        ]);
        let listing = store.list().await.unwrap();
        assert_eq!(
            listing,
            vec![ObjectInfo::new("a", 2), ObjectInfo::new("b", 5)]
        );
    }

    #[tokio::test]
    async fn memory_injected_failures_leave_no_object() {
        let store = InMemoryStore::new();
        store.fail_next_uploads(2);
        assert!(store.upload("x", Bytes::new()).await.is_err());
        assert!(store.upload("x", Bytes::new()).await.is_err());
        assert!(store.is_empty());
        store.upload("x", Bytes::new()).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_stalled_upload_never_completes() {
        let store = InMemoryStore::new();
        store.set_stalled(true);
        let result =
            tokio::time::timeout(Duration::from_millis(50), store.upload("x", Bytes::new())).await;
        assert!(result.is_err());
        assert!(store.is_empty());
    }
}
