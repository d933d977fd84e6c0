//! Authoritative document store reached over HTTP.
//!
//! Only explicit saves and the first load of an empty document talk to it;
//! live collaboration never does.
//!
//! ```text
//! GET  {base}/projects/{id}/document   → 200 snapshot | 404 none yet
//! POST {base}/projects/{id}/document   ← application/octet-stream snapshot
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote request failed: {0}")]
    Request(String),
    #[error("remote store answered {status}")]
    Status { status: u16 },
    #[error("remote request timed out")]
    Timeout,
    #[error("remote store unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if let Some(status) = e.status() {
            RemoteError::Status {
                status: status.as_u16(),
            }
        } else {
            RemoteError::Request(e.to_string())
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Latest saved snapshot; `None` when the project was never saved.
    async fn load(&self, project_id: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn save(&self, project_id: &str, snapshot: Vec<u8>) -> Result<(), RemoteError>;
}

// ───────────────────────────────────────────────────────────────────
// HTTP
// ───────────────────────────────────────────────────────────────────

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Request(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn document_url(&self, project_id: &str) -> String {
        format!("{}/projects/{project_id}/document", self.base_url)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn load(&self, project_id: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let response = self.client.get(self.document_url(project_id)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                log::debug!("Loaded {} byte snapshot of {project_id}", bytes.len());
                Ok(Some(bytes.to_vec()))
            }
            status => Err(RemoteError::Status {
                status: status.as_u16(),
            }),
        }
    }

    async fn save(&self, project_id: &str, snapshot: Vec<u8>) -> Result<(), RemoteError> {
        let size = snapshot.len();
        let response = self
            .client
            .post(self.document_url(project_id))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(snapshot)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }
        log::info!("Saved {size} byte snapshot of {project_id}");
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// In memory
// ───────────────────────────────────────────────────────────────────

/// Snapshots kept in process; used offline and in tests.
#[derive(Default)]
pub struct MemoryRemoteStore {
    documents: RwLock<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    saves: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with [`RemoteError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every following call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self, project_id: &str) -> Option<Vec<u8>> {
        self.documents.read().await.get(project_id).cloned()
    }

    pub async fn insert(&self, project_id: &str, snapshot: Vec<u8>) {
        self.documents.write().await.insert(project_id.to_string(), snapshot);
    }

    async fn simulate(&self) -> Result<(), RemoteError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn load(&self, project_id: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.simulate().await?;
        Ok(self.snapshot(project_id).await)
    }

    async fn save(&self, project_id: &str, snapshot: Vec<u8>) -> Result<(), RemoteError> {
        self.simulate().await?;
        self.insert(project_id, snapshot).await;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryRemoteStore::new();
        assert_eq!(store.load("p1").await.unwrap(), None);
        store.save("p1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.load("p1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_failure_knob() {
        let store = MemoryRemoteStore::new();
        store.set_failing(true);
        assert_eq!(store.save("p1", vec![1]).await, Err(RemoteError::Unavailable));
        assert_eq!(store.load("p1").await, Err(RemoteError::Unavailable));
        store.set_failing(false);
        assert!(store.save("p1", vec![1]).await.is_ok());
    }

    #[test]
    fn test_http_document_url() {
        let store = HttpRemoteStore::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(store.document_url("abc"), "https://api.example.com/projects/abc/document");
    }

    #[tokio::test]
    async fn test_http_unreachable_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = HttpRemoteStore::new(format!("http://127.0.0.1:{port}"), Duration::from_secs(2)).unwrap();
        assert!(store.load("p1").await.is_err());
    }

    #[tokio::test]
    async fn test_http_not_found_means_never_saved() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let store = HttpRemoteStore::new(format!("http://127.0.0.1:{port}"), Duration::from_secs(2)).unwrap();
        assert_eq!(store.load("p1").await.unwrap(), None);
    }
}
