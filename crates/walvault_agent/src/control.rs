//! Control-plane collaborator.
//!
//! The control plane receives one registration per run and periodic
//! pushes of aggregated transaction-log text. The agent logs failures of
//! these calls but never retries them itself.
//!
//! The HTTP client is abstracted via a trait so that any HTTP library (or
//! an in-process fake) can carry the requests.

use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use url::form_urlencoded;

/// Identity and policy fields reported at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Contact address.
    pub email: String,
    /// Alerting threshold.
    pub warn_at: String,
    /// Retention.
    pub retention: i64,
    /// Seconds between base backups.
    pub base_interval: i64,
    /// Rollover interval in seconds.
    pub rollover: i64,
}

/// Body of a transaction-log push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogPush {
    /// Log text, one line per commit.
    pub d: String,
}

/// The control plane the agent reports to.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Registers the backup and its policy.
    async fn register(&self, registration: &Registration) -> AgentResult<()>;

    /// Pushes a batch of transaction-log text.
    async fn push_tx_log(&self, text: &str) -> AgentResult<()>;
}

/// HTTP method used by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// PUT.
    Put,
    /// POST.
    Post,
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a JSON request and returns the response body.
    ///
    /// Non-success statuses are reported as `Err` with a description.
    async fn send(&self, method: HttpMethod, url: &str, body: Vec<u8>)
        -> Result<Vec<u8>, String>;
}

/// Control plane reached over HTTP with JSON bodies.
pub struct HttpControlPlane<C: HttpClient> {
    base_url: String,
    backup_id: i64,
    auth: String,
    client: C,
}

impl<C: HttpClient> HttpControlPlane<C> {
    /// Creates a control plane client.
    pub fn new(
        base_url: impl Into<String>,
        backup_id: i64,
        auth: impl Into<String>,
        client: C,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            backup_id,
            auth: auth.into(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("auth", &self.auth)
            .finish();
        format!(
            "{}/v1/{}{}?{}",
            self.base_url.trim_end_matches('/'),
            self.backup_id,
            path,
            query
        )
    }

    async fn call<T: Serialize + Sync>(
        &self,
        method: HttpMethod,
        path: &str,
        body: &T,
    ) -> AgentResult<()> {
        let body = serde_json::to_vec(body)
            .map_err(|e| AgentError::ControlPlane(format!("cannot encode request: {e}")))?;
        self.client
            .send(method, &self.url(path), body)
            .await
            .map(|_| ())
            .map_err(AgentError::ControlPlane)
    }
}

#[async_trait]
impl<C: HttpClient> ControlPlane for HttpControlPlane<C> {
    async fn register(&self, registration: &Registration) -> AgentResult<()> {
        self.call(HttpMethod::Put, "", registration).await
    }

    async fn push_tx_log(&self, text: &str) -> AgentResult<()> {
        let body = TxLogPush { d: text.to_string() };
        self.call(HttpMethod::Post, "/tx", &body).await
    }
}

/// A control plane that records calls, for testing.
#[derive(Debug, Default)]
pub struct MemoryControlPlane {
    registrations: Mutex<Vec<Registration>>,
    pushes: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MemoryControlPlane {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the registrations received.
    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().clone()
    }

    /// Returns the transaction-log pushes received.
    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().clone()
    }

    fn check(&self) -> AgentResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::ControlPlane("unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn register(&self, registration: &Registration) -> AgentResult<()> {
        self.check()?;
        self.registrations.lock().push(registration.clone());
        Ok(())
    }

    async fn push_tx_log(&self, text: &str) -> AgentResult<()> {
        self.check()?;
        self.pushes.lock().push(text.to_string());
        Ok(())
    }
}

#[async_trait]
impl<P: ControlPlane + ?Sized> ControlPlane for std::sync::Arc<P> {
    async fn register(&self, registration: &Registration) -> AgentResult<()> {
        (**self).register(registration).await
    }

    async fn push_tx_log(&self, text: &str) -> AgentResult<()> {
        (**self).push_tx_log(text).await
    }
}
