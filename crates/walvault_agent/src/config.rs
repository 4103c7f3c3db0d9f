//! Configuration for the backup agent.
//!
//! The configuration file is JSON with kebab-case keys:
//!
//! ```json
//! {
//!   "encrypt-key": "<base64, 32 bytes>",
//!   "conn-string": "host=/var/run/postgresql user=backup",
//!   "auth": "secret",
//!   "id": 42,
//!   "guid": "6350021914257315137",
//!   "store": "file:///var/backups/db1",
//!   "email": "ops@example.com",
//!   "warn-at": "2h",
//!   "retention": 30,
//!   "base-interval": 0,
//!   "rollover": 300
//! }
//! ```
//!
//! Run-time tuning (queue depths, timers) is not read from the file; it is
//! set with the `with_*` builder methods.

use crate::control::{HttpClient, HttpControlPlane, Registration};
use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use walvault_storage::{EncryptingStore, EncryptionKey, FileStore, ObjectStore};

/// Locations tried by [`AgentConfig::discover`], in order.
pub const CONFIG_SEARCH_PATH: [&str; 2] = ["walvault.conf", "/etc/walvault.conf"];

/// Size of a base-backup part before it is split off (256 MiB).
pub const DEFAULT_BASE_PART_SIZE: usize = 0x1000_0000;

/// Scheme of directory-backed store URLs.
const FILE_SCHEME: &str = "file://";

/// Agent configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentConfig {
    /// Base64 AES-256 key for stored objects.
    pub encrypt_key: String,
    /// Connection string of the source database.
    pub conn_string: String,
    /// Control-plane credential.
    pub auth: String,
    /// Backup id at the control plane.
    pub id: i64,
    /// Expected system id of the source database.
    pub guid: String,
    /// Store URL.
    pub store: String,
    /// Contact address registered with the control plane.
    pub email: String,
    /// Alerting threshold registered with the control plane.
    pub warn_at: String,
    /// Retention registered with the control plane.
    pub retention: i64,
    /// Base-backup interval reported to the control plane.
    pub base_interval: i64,
    /// Seconds after the last segment before a segment switch is forced;
    /// zero disables the rollover timer.
    pub rollover: i64,
    /// Run-time tuning.
    #[serde(skip)]
    pub tuning: AgentTuning,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

/// Run-time tuning of the agent's workers.
#[derive(Debug, Clone)]
pub struct AgentTuning {
    /// Bound of the upload hand-off queue.
    pub upload_queue_depth: usize,
    /// Bound of the transaction-log hand-off queue.
    pub txlog_queue_depth: usize,
    /// Delay before the worker group is restarted.
    pub restart_cooldown: Duration,
    /// Age after which a new base backup is started.
    pub stale_base_after: Duration,
    /// Delay before the first transaction-log flush.
    pub txlog_first_flush: Duration,
    /// Delay between transaction-log flushes.
    pub txlog_flush_interval: Duration,
    /// Commit-time span after which buffered log text is flushed early.
    pub txlog_staleness: Duration,
    /// Size at which a base backup is split into a part.
    pub base_part_size: usize,
    /// Base URL of the control plane.
    pub control_plane_url: String,
}

impl Default for AgentTuning {
    fn default() -> Self {
        Self {
            upload_queue_depth: 16,
            txlog_queue_depth: 16,
            restart_cooldown: Duration::from_secs(2),
            stale_base_after: Duration::from_secs(4 * 60 * 60),
            txlog_first_flush: Duration::from_secs(10),
            txlog_flush_interval: Duration::from_secs(60),
            txlog_staleness: Duration::from_secs(60),
            base_part_size: DEFAULT_BASE_PART_SIZE,
            control_plane_url: "https://api.walvault.io".to_string(),
        }
    }
}

impl AgentConfig {
    /// Parses and validates a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if the text is not valid JSON or a
    /// required key is missing.
    pub fn from_json(text: &str) -> AgentResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| AgentError::config(format!("cannot parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> AgentResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&text)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Loads the first readable configuration from [`CONFIG_SEARCH_PATH`].
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if no location holds a valid
    /// configuration.
    pub fn discover() -> AgentResult<Self> {
        for candidate in CONFIG_SEARCH_PATH {
            match Self::load(Path::new(candidate)) {
                Ok(config) => return Ok(config),
                Err(e) => debug!(path = candidate, error = %e, "configuration not usable"),
            }
        }
        Err(AgentError::config(format!(
            "could not read any of {}",
            CONFIG_SEARCH_PATH.join(", ")
        )))
    }

    /// Checks that all required keys are present.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] naming the first missing key.
    pub fn validate(&self) -> AgentResult<()> {
        let required = [
            ("encrypt-key", &self.encrypt_key),
            ("conn-string", &self.conn_string),
            ("store", &self.store),
            ("guid", &self.guid),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(AgentError::config(format!("missing required key {key:?}")));
            }
        }
        Ok(())
    }

    /// Returns the file this configuration was loaded from, if any.
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Decodes the encryption key.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if the key is not 32 bytes of base64.
    pub fn encryption_key(&self) -> AgentResult<EncryptionKey> {
        EncryptionKey::from_base64(&self.encrypt_key)
            .map_err(|e| AgentError::config(format!("encrypt-key: {e}")))
    }

    /// Opens the configured store behind the encrypting wrapper.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] for unsupported store URLs or a bad
    /// key, or a store error if the store cannot be opened.
    pub async fn open_store(&self) -> AgentResult<Arc<dyn ObjectStore>> {
        let key = self.encryption_key()?;
        let Some(root) = self.store.strip_prefix(FILE_SCHEME) else {
            return Err(AgentError::config(format!(
                "unsupported store URL {:?}",
                self.store
            )));
        };
        let inner = FileStore::open_with_create_dirs(Path::new(root)).await?;
        Ok(Arc::new(EncryptingStore::new(inner, &key)))
    }

    /// Returns the age after which a new base backup is started.
    ///
    /// `base-interval` is only registered with the control plane and does
    /// not change this age.
    pub fn stale_base_after(&self) -> Duration {
        self.tuning.stale_base_after
    }

    /// Returns the rollover interval, if enabled.
    pub fn rollover_interval(&self) -> Option<Duration> {
        (self.rollover > 0).then(|| Duration::from_secs(self.rollover as u64))
    }

    /// Returns the policy fields reported to the control plane.
    pub fn registration(&self) -> Registration {
        Registration {
            email: self.email.clone(),
            warn_at: self.warn_at.clone(),
            retention: self.retention,
            base_interval: self.base_interval,
            rollover: self.rollover,
        }
    }

    /// Sets the upload queue bound.
    pub fn with_upload_queue_depth(mut self, depth: usize) -> Self {
        self.tuning.upload_queue_depth = depth;
        self
    }

    /// Sets the transaction-log queue bound.
    pub fn with_txlog_queue_depth(mut self, depth: usize) -> Self {
        self.tuning.txlog_queue_depth = depth;
        self
    }

    /// Sets the restart cooldown.
    pub fn with_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.tuning.restart_cooldown = cooldown;
        self
    }

    /// Sets the base backup age limit.
    pub fn with_stale_base_after(mut self, age: Duration) -> Self {
        self.tuning.stale_base_after = age;
        self
    }

    /// Sets the transaction-log flush timers.
    pub fn with_txlog_flush(mut self, first: Duration, interval: Duration) -> Self {
        self.tuning.txlog_first_flush = first;
        self.tuning.txlog_flush_interval = interval;
        self
    }

    /// Sets the transaction-log staleness bound.
    pub fn with_txlog_staleness(mut self, staleness: Duration) -> Self {
        self.tuning.txlog_staleness = staleness;
        self
    }

    /// Sets the base-backup part size.
    pub fn with_base_part_size(mut self, size: usize) -> Self {
        self.tuning.base_part_size = size;
        self
    }

    /// Sets the control plane base URL.
    pub fn with_control_plane_url(mut self, url: impl Into<String>) -> Self {
        self.tuning.control_plane_url = url.into();
        self
    }

    /// Builds the HTTP control plane for this backup over `client`.
    pub fn http_control_plane<C: HttpClient>(&self, client: C) -> HttpControlPlane<C> {
        HttpControlPlane::new(
            self.tuning.control_plane_url.clone(),
            self.id,
            self.auth.clone(),
            client,
        )
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("encrypt_key", &"[REDACTED]")
            .field("conn_string", &self.conn_string)
            .field("auth", &"[REDACTED]")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .field("store", &self.store)
            .field("email", &self.email)
            .field("warn_at", &self.warn_at)
            .field("retention", &self.retention)
            .field("base_interval", &self.base_interval)
            .field("rollover", &self.rollover)
            .field("tuning", &self.tuning)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn sample(store: &str) -> String {
        format!(
            r#"{{
                "encrypt-key": "{}",
                "conn-string": "host=localhost",
                "auth": "s3cret",
                "id": 7,
                "guid": "6350021914257315137",
                "store": "{store}",
                "rollover": 300,
                "warn-at": "1h"
            }}"#,
            EncryptionKey::from_bytes(&[5u8; 32]).unwrap().to_base64()
        )
    }

    #[test]
    fn parses_kebab_case_keys() {
        let config = AgentConfig::from_json(&sample("file:///tmp/x")).unwrap();
        assert_eq!(config.id, 7);
        assert_eq!(config.guid, "6350021914257315137");
        assert_eq!(config.warn_at, "1h");
        assert_eq!(config.rollover_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.tuning.upload_queue_depth, 16);
        assert!(config.encryption_key().is_ok());
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let err = AgentConfig::from_json(r#"{"encrypt-key": "x", "store": "file:///x"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("conn-string"));
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            AgentConfig::from_json("{not json"),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn base_interval_is_registered_but_keeps_default_age() {
        let mut config = AgentConfig::default();
        assert_eq!(config.stale_base_after(), Duration::from_secs(4 * 60 * 60));
        config.base_interval = 12;
        assert_eq!(config.stale_base_after(), Duration::from_secs(4 * 60 * 60));
        assert_eq!(config.registration().base_interval, 12);
        assert_eq!(config.rollover_interval(), None);

        let config = config.with_stale_base_after(Duration::from_secs(60));
        assert_eq!(config.stale_base_after(), Duration::from_secs(60));
    }

    #[test]
    fn builders_set_tuning() {
        let config = AgentConfig::default()
            .with_upload_queue_depth(2)
            .with_restart_cooldown(Duration::from_millis(10))
            .with_base_part_size(1024);
        assert_eq!(config.tuning.upload_queue_depth, 2);
        assert_eq!(config.tuning.restart_cooldown, Duration::from_millis(10));
        assert_eq!(config.tuning.base_part_size, 1024);
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = AgentConfig::from_json(&sample("file:///tmp/x")).unwrap();
        let text = format!("{config:?}");
        assert!(!text.contains("s3cret"));
        assert!(!text.contains(&config.encrypt_key));
    }

    #[test]
    fn load_records_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("walvault.conf");
        std::fs::write(&path, sample("file:///tmp/x")).unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.source_path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn opens_encrypted_file_store() {
        let dir = tempdir().unwrap();
        let url = format!("file://{}", dir.path().join("store").display());
        let config = AgentConfig::from_json(&sample(&url)).unwrap();
        let store = config.open_store().await.unwrap();
        store.upload("0.1.wal", Bytes::from_static(b"wal")).await.unwrap();
        assert_eq!(&store.download("0.1.wal").await.unwrap()[..], b"wal");
        let raw = std::fs::read(dir.path().join("store").join("0.1.wal")).unwrap();
        assert_ne!(raw, b"wal");
    }

    #[tokio::test]
    async fn rejects_unknown_store_scheme() {
        let config = AgentConfig::from_json(&sample("s3://bucket/prefix")).unwrap();
        assert!(matches!(
            config.open_store().await,
            Err(AgentError::Config(_))
        ));
    }
}
