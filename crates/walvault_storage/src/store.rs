//! Object store trait definition.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;

/// One entry of a store listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectInfo {
    /// Object name.
    pub name: String,
    /// Stored size in bytes (as held by this store, after any encoding).
    pub size: u64,
}

impl ObjectInfo {
    /// Creates a listing entry.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// A durable name → bytes store.
///
/// # Contract
///
/// - `upload` either makes the whole object visible under `name` or
///   leaves no object behind; an existing object is replaced
/// - `download` returns exactly the bytes last uploaded under `name`, or
///   [`StoreError::NotFound`](crate::StoreError::NotFound)
/// - `list` returns every visible object, in no particular order
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; workers share one store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `data` under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the object could not be stored.
    async fn upload(&self, name: &str, data: Bytes) -> StoreResult<()>;

    /// Fetches the object stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing object, or a backend error.
    async fn download(&self, name: &str) -> StoreResult<Bytes>;

    /// Lists all objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing could not be obtained.
    async fn list(&self) -> StoreResult<Vec<ObjectInfo>>;
}

#[async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<S> {
    async fn upload(&self, name: &str, data: Bytes) -> StoreResult<()> {
        (**self).upload(name, data).await
    }

    async fn download(&self, name: &str) -> StoreResult<Bytes> {
        (**self).download(name).await
    }

    async fn list(&self) -> StoreResult<Vec<ObjectInfo>> {
        (**self).list().await
    }
}
