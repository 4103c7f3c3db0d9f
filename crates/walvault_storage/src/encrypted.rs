//! Encrypting object store wrapper.
//!
//! This module provides a store that wraps any other [`ObjectStore`] with
//! zstd compression and AES-256-GCM encryption at rest.
//!
//! ## Security Model
//!
//! - Objects are compressed, then encrypted as a whole
//! - Stored layout: `ciphertext || tag (16 bytes)`
//! - The nonce is the first 12 bytes of SHA-256 of the object name, so it
//!   is never stored; a name must never be reused for different content
//! - The name is also bound as associated data, so an object copied to
//!   another name fails authentication
//! - Keys are never stored; they are provided by configuration
//!
//! Downloads verify the tag before decompressing. Any failure after the
//! bytes were fetched is reported as [`StoreError::Decode`], distinct from
//! the wrapped store's own errors.

use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectInfo, ObjectStore};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// zstd compression level applied before encryption.
pub const ZSTD_LEVEL: i32 = 3;

/// Encryption key for the encrypting store.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random encryption key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StoreError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Decodes a key from standard base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not base64 or does not decode to
    /// exactly 32 bytes.
    pub fn from_base64(text: &str) -> StoreResult<Self> {
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Encodes the key as standard base64.
    ///
    /// # Security
    ///
    /// Don't log the result.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    /// Returns the key as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Compression and encryption of whole objects.
struct ObjectCodec {
    cipher: Aes256Gcm,
}

impl ObjectCodec {
    fn new(key: &EncryptionKey) -> Self {
        let key_array = GenericArray::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key_array),
        }
    }

    fn nonce_for(name: &str) -> [u8; NONCE_SIZE] {
        let digest = Sha256::digest(name.as_bytes());
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }

    fn seal(&self, name: &str, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let mut compressed = Vec::with_capacity(plaintext.len() / 2 + 64);
        let mut encoder = zstd::stream::write::Encoder::new(&mut compressed, ZSTD_LEVEL)?;
        encoder.write_all(plaintext)?;
        encoder.finish()?;

        let nonce_bytes = Self::nonce_for(name);
        let payload = Payload {
            msg: &compressed,
            aad: name.as_bytes(),
        };
        self.cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| StoreError::Backend(format!("encryption of {name} failed")))
    }

    fn open(&self, name: &str, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        if sealed.len() < TAG_SIZE {
            return Err(StoreError::decode(name, "ciphertext too short"));
        }
        let nonce_bytes = Self::nonce_for(name);
        let payload = Payload {
            msg: sealed,
            aad: name.as_bytes(),
        };
        let compressed = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| StoreError::decode(name, "authentication failed"))?;
        zstd::stream::decode_all(compressed.as_slice())
            .map_err(|e| StoreError::decode(name, format!("decompression failed: {e}")))
    }
}

/// An object store that compresses and encrypts everything it stores.
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use walvault_storage::{EncryptingStore, EncryptionKey, InMemoryStore, ObjectStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = EncryptingStore::new(InMemoryStore::new(), &EncryptionKey::generate());
/// store.upload("0.1.wal", Bytes::from_static(b"pages")).await.unwrap();
/// assert_ne!(&store.inner().get("0.1.wal").unwrap()[..], b"pages");
/// assert_eq!(&store.download("0.1.wal").await.unwrap()[..], b"pages");
/// # });
/// ```
pub struct EncryptingStore<S> {
    inner: S,
    codec: Arc<ObjectCodec>,
}

impl<S: ObjectStore> EncryptingStore<S> {
    /// Wraps `inner`, encrypting with `key`.
    pub fn new(inner: S, key: &EncryptionKey) -> Self {
        Self {
            inner,
            codec: Arc::new(ObjectCodec::new(key)),
        }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwraps the wrapped store.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> std::fmt::Debug for EncryptingStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptingStore")
            .field("cipher", &"Aes256Gcm")
            .finish_non_exhaustive()
    }
}

fn codec_task_failed(e: tokio::task::JoinError) -> StoreError {
    StoreError::Backend(format!("codec task failed: {e}"))
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for EncryptingStore<S> {
    async fn upload(&self, name: &str, data: Bytes) -> StoreResult<()> {
        let codec = Arc::clone(&self.codec);
        let owned = name.to_string();
        let sealed = tokio::task::spawn_blocking(move || codec.seal(&owned, &data))
            .await
            .map_err(codec_task_failed)??;
        self.inner.upload(name, Bytes::from(sealed)).await
    }

    async fn download(&self, name: &str) -> StoreResult<Bytes> {
        let sealed = self.inner.download(name).await?;
        let codec = Arc::clone(&self.codec);
        let owned = name.to_string();
        let plain = tokio::task::spawn_blocking(move || codec.open(&owned, &sealed))
            .await
            .map_err(codec_task_failed)??;
        Ok(Bytes::from(plain))
    }

    async fn list(&self) -> StoreResult<Vec<ObjectInfo>> {
        self.inner.list().await
    }
}
