//! HTTP client for the agent's Unix socket.
//!
//! One connection per request; the agent is local and the calls are
//! infrequent control operations, not a data path. The control plane
//! never runs privileged host tooling itself.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use nos_common::agent::*;
use nos_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Overall bound per agent call; replication-sized work goes through jobs
/// on the agent side, not through this client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AgentClient {
    socket_path: PathBuf,
}

impl AgentClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.request_inner(method, path, body))
            .await
            .map_err(|_| Error::Internal(format!("agent call {} timed out", path)))?
    }

    async fn request_inner<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Internal(format!(
                "agent socket {} unreachable: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Internal(format!("agent handshake failed: {}", e)))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let payload = match body {
            Some(b) => Bytes::from(serde_json::to_vec(b)?),
            None => Bytes::new(),
        };
        debug!(%method, path, bytes = payload.len(), "agent request");

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("host", "nos-agent")
            .header("content-type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| Error::Internal(format!("building agent request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Internal(format!("agent request failed: {}", e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Internal(format!("reading agent response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(status_to_error(status, message));
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        self.request::<(), R>(Method::GET, path, None).await
    }

    /// Liveness probe used at startup.
    pub async fn health(&self) -> Result<OkResponse> {
        self.get("/v1/health").await
    }

    pub async fn run(&self, req: &RunRequest) -> Result<RunResponse> {
        self.post("/v1/run", req).await
    }

    pub async fn snapshot_create(
        &self,
        req: &SnapshotCreateRequest,
    ) -> Result<SnapshotCreateResponse> {
        self.post("/v1/snapshot/create", req).await
    }

    pub async fn snapshot_list(&self, path: &str) -> Result<SnapshotListResponse> {
        self.post(
            "/v1/snapshot/list",
            &SnapshotListRequest {
                path: path.to_string(),
            },
        )
        .await
    }

    pub async fn snapshot_prune(&self, req: &SnapshotPruneRequest) -> Result<SnapshotPruneResponse> {
        self.post("/v1/snapshot/prune", req).await
    }

    pub async fn snapshot_rollback(
        &self,
        req: &SnapshotRollbackRequest,
    ) -> Result<SnapshotRollbackResponse> {
        self.post("/v1/snapshot/rollback", req).await
    }

    pub async fn snapshot_delete(&self, location: &str, backend: SnapshotBackend) -> Result<OkResponse> {
        self.post(
            "/v1/snapshot/delete",
            &SnapshotDeleteRequest {
                location: location.to_string(),
                backend,
            },
        )
        .await
    }

    pub async fn btrfs_snapshot(&self, req: &BtrfsSnapshotRequest) -> Result<BtrfsSnapshotResponse> {
        self.post("/v1/btrfs/snapshot", req).await
    }

    pub async fn firewall_apply(&self, req: &FirewallApplyRequest) -> Result<FirewallApplyResponse> {
        self.post("/v1/firewall/apply", req).await
    }

    pub async fn fstab_ensure(&self, line: &str) -> Result<OkResponse> {
        self.post(
            "/v1/fstab/ensure",
            &LineRequest {
                line: line.to_string(),
            },
        )
        .await
    }

    pub async fn fstab_remove(&self, contains: &str) -> Result<OkResponse> {
        self.post(
            "/v1/fstab/remove",
            &RemoveLineRequest {
                contains: contains.to_string(),
            },
        )
        .await
    }

    pub async fn fs_mkdir(&self, req: &MkdirRequest) -> Result<OkResponse> {
        self.post("/v1/fs/mkdir", req).await
    }

    pub async fn fs_write(&self, req: &WriteFileRequest) -> Result<OkResponse> {
        self.post("/v1/fs/write", req).await
    }
}

fn status_to_error(status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::BAD_REQUEST => Error::InvalidInput(message),
        StatusCode::FORBIDDEN => Error::NotAllowed(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT => Error::Conflict(message),
        StatusCode::PRECONDITION_FAILED => Error::PreconditionFailed(message),
        StatusCode::PAYLOAD_TOO_LARGE => Error::PayloadTooLarge(message),
        StatusCode::NOT_IMPLEMENTED => Error::NotImplemented(message),
        _ => Error::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_to_error(StatusCode::FORBIDDEN, "invalid_command".into()),
            Error::NotAllowed(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::PRECONDITION_FAILED, "syntax".into()),
            Error::PreconditionFailed(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::INTERNAL_SERVER_ERROR, "boom".into()),
            Error::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_internal_error() {
        let client = AgentClient::new(PathBuf::from("/nonexistent/agent.sock"));
        let err = client.health().await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }
}
