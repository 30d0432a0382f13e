//! Roster blob store.
//!
//! Content-addressed put/get keyed by the blob's SHA-256 digest. Puts
//! are idempotent and nothing is ever deleted. Retrieval of a roster
//! that a visible Bitcoin checkpoint references must succeed; a missing
//! referenced blob is a permanent error that needs operator attention,
//! while transport failures are transient and retried by the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Storage errors, split along the retry boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure; retry with backoff.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The store answered but the object is gone. Fatal when the chain
    /// references it.
    #[error("roster blob {0} not found")]
    NotFound(String),

    /// The store answered with something unusable.
    #[error("invalid store response: {0}")]
    Invalid(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Content-addressed roster blob store.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Store `blob` under its content hash. Idempotent.
    async fn put(&self, hash: &[u8; 32], blob: &[u8]) -> StoreResult<()>;

    /// Fetch the blob stored under `hash`, if present.
    async fn get(&self, hash: &[u8; 32]) -> StoreResult<Option<Vec<u8>>>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryRosterStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn put(&self, hash: &[u8; 32], blob: &[u8]) -> StoreResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.entry(hex::encode(hash)).or_insert_with(|| blob.to_vec());
        Ok(())
    }

    async fn get(&self, hash: &[u8; 32]) -> StoreResult<Option<Vec<u8>>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(&hex::encode(hash)).cloned())
    }
}

/// HTTP object store: blobs live at `<base>/<hex digest>`.
#[derive(Debug, Clone)]
pub struct HttpRosterStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRosterStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, hash: &[u8; 32]) -> String {
        format!("{}/{}", self.base_url, hex::encode(hash))
    }
}

#[async_trait]
impl RosterStore for HttpRosterStore {
    async fn put(&self, hash: &[u8; 32], blob: &[u8]) -> StoreResult<()> {
        let resp = self
            .client
            .put(self.object_url(hash))
            .body(blob.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StoreError::Transient(format!(
                "put returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, hash: &[u8; 32]) -> StoreResult<Option<Vec<u8>>> {
        let resp = self
            .client
            .get(self.object_url(hash))
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::Transient(format!(
                "get returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }
}
