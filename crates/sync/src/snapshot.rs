/// Snapshot client seam
///
/// The request/response API that serves authoritative batch snapshots. The
/// core calls it on its own schedule (default poll, raised while fallback is
/// active) and treats every response as one-shot state, never as a stream.
use crate::batch::Batch;
use async_trait::async_trait;
use thiserror::Error;

/// Snapshot fetch errors
#[derive(Debug, Error)]
pub enum SnapshotClientError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// External collaborator serving authoritative snapshots
#[async_trait]
pub trait SnapshotClient: Send + Sync {
    /// Full batch list at fetch time
    async fn fetch_batch_list(&self) -> Result<Vec<Batch>, SnapshotClientError>;

    /// One batch at fetch time
    async fn fetch_batch(&self, id: &str) -> Result<Batch, SnapshotClientError>;
}

/// Production snapshot client over the station gateway's JSON API
pub struct HttpSnapshotClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSnapshotClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SnapshotClient for HttpSnapshotClient {
    async fn fetch_batch_list(&self) -> Result<Vec<Batch>, SnapshotClientError> {
        let url = format!("{}/batches", self.base_url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SnapshotClientError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| SnapshotClientError::Request(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| SnapshotClientError::Decode(e.to_string()))
    }

    async fn fetch_batch(&self, id: &str) -> Result<Batch, SnapshotClientError> {
        let url = format!("{}/batches/{}", self.base_url, id);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SnapshotClientError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| SnapshotClientError::Request(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| SnapshotClientError::Decode(e.to_string()))
    }
}
