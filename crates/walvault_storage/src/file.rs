//! Directory-backed object store.

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectInfo, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Prefix of in-flight upload files; such files are never listed.
const STAGING_PREFIX: char = '.';

/// An object store keeping one file per object in a directory.
///
/// # Durability
///
/// Each upload is written to a hidden staging file in the same directory,
/// synced, and then renamed over the final name. A crash or failed write
/// leaves at most a staging file behind, never a partial object.
///
/// # Example
///
/// ```no_run
/// use walvault_storage::{FileStore, ObjectStore};
/// use std::path::Path;
///
/// # async fn demo() -> walvault_storage::StoreResult<()> {
/// let store = FileStore::open_with_create_dirs(Path::new("/var/backups/db1")).await?;
/// let names: Vec<_> = store.list().await?.into_iter().map(|o| o.name).collect();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at an existing directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` does not exist or is not a directory.
    pub async fn open(root: &Path) -> StoreResult<Self> {
        let meta = fs::metadata(root).await?;
        if !meta.is_dir() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Opens a store, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open_with_create_dirs(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root).await?;
        Self::open(root).await
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> StoreResult<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with(STAGING_PREFIX)
            && !name.contains(['/', '\\'])
            && name != "..";
        if !valid {
            return Err(StoreError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(name))
    }

    async fn write_staged(staging: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(staging).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn upload(&self, name: &str, data: Bytes) -> StoreResult<()> {
        let target = self.object_path(name)?;
        let staging = self.root.join(format!(
            "{STAGING_PREFIX}{name}.{:016x}.tmp",
            rand::thread_rng().next_u64()
        ));

        if let Err(e) = Self::write_staged(&staging, &data).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        debug!(name, size = data.len(), "stored object");
        Ok(())
    }

    async fn download(&self, name: &str) -> StoreResult<Bytes> {
        let path = self.object_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> StoreResult<Vec<ObjectInfo>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                objects.push(ObjectInfo::new(name, meta.len()));
            }
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_upload_and_download() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store
            .upload("1000000.5f000000.wal", Bytes::from_static(b"segment"))
            .await
            .unwrap();
        let data = store.download("1000000.5f000000.wal").await.unwrap();
        assert_eq!(&data[..], b"segment");
    }

    #[tokio::test]
    async fn file_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.download("absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn file_list_skips_staging_files() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.upload("a", Bytes::from_static(b"1")).await.unwrap();
        store.upload("b", Bytes::from_static(b"22")).await.unwrap();
        std::fs::write(dir.path().join(".c.0.tmp"), b"partial").unwrap();

        let mut listing = store.list().await.unwrap();
        listing.sort();
        assert_eq!(listing, vec![ObjectInfo::new("a", 1), ObjectInfo::new("b", 2)]);
    }

    #[tokio::test]
    async fn file_upload_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.upload("a", Bytes::from_static(b"1")).await.unwrap();
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn file_rejects_path_names() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        for name in ["", "../x", "a/b", ".hidden"] {
            let err = store.upload(name, Bytes::new()).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidName { .. }), "{name}");
        }
    }

    #[tokio::test]
    async fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("nested").join("store");
        let store = FileStore::open_with_create_dirs(&root).await.unwrap();
        assert_eq!(store.root(), root.as_path());
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn file_open_missing_dir_fails() {
        let dir = tempdir().unwrap();
        assert!(FileStore::open(&dir.path().join("missing")).await.is_err());
    }
}
