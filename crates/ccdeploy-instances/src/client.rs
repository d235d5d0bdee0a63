//! Scheduler client: fetches the actual instances of a process.
//!
//! The scheduler is consulted on demand, one process at a time, with no
//! persistent connection: every query opens a fresh HTTP/1.1 connection
//! and is bounded by a timeout.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ccdeploy_state::ProcessRecord;

use crate::error::InstancesError;

/// Native instance state as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Unclaimed,
    Claimed,
    Running,
    Crashed,
    /// Any state this client does not recognize.
    #[serde(other)]
    Unknown,
}

/// One instance of a process as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualInstance {
    pub index: u32,
    pub state: SchedulerState,
    /// Nanoseconds since the unix epoch at which the instance entered `state`.
    pub since: u64,
    #[serde(default, rename = "instance_guid", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_error: Option<String>,
}

/// Narrow, read-only view of the workload scheduler.
#[async_trait]
pub trait InstancesClient: Send + Sync {
    /// List the instances the scheduler currently tracks for `process`.
    async fn actual_instances(
        &self,
        process: &ProcessRecord,
    ) -> Result<Vec<ActualInstance>, InstancesError>;
}

/// `InstancesClient` speaking JSON over HTTP/1.1 to the scheduler.
#[derive(Debug, Clone)]
pub struct HttpInstancesClient {
    /// Scheduler listen address (`host:port`).
    address: String,
    timeout: Duration,
}

impl HttpInstancesClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn fetch(&self, path: &str) -> Result<Bytes, InstancesError> {
        let uri = format!("http://{}{path}", self.address);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| InstancesError::Transport(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| InstancesError::Transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &self.address)
            .header("accept", "application/json")
            .header("user-agent", "ccdeploy-instances/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| InstancesError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| InstancesError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            debug!(status = %resp.status(), %uri, "scheduler query non-2xx");
            return Err(InstancesError::Status(resp.status().as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| InstancesError::Transport(e.to_string()))?;
        Ok(body.to_bytes())
    }
}

#[async_trait]
impl InstancesClient for HttpInstancesClient {
    async fn actual_instances(
        &self,
        process: &ProcessRecord,
    ) -> Result<Vec<ActualInstance>, InstancesError> {
        let path = format!("/v1/actual_lrps?process_guid={}", process.id);

        let body = tokio::time::timeout(self.timeout, self.fetch(&path))
            .await
            .map_err(|_| InstancesError::Timeout(self.timeout))??;

        let instances: Vec<ActualInstance> =
            serde_json::from_slice(&body).map_err(|e| InstancesError::Decode(e.to_string()))?;
        debug!(process = %process.id, count = instances.len(), "scheduler instances fetched");
        Ok(instances)
    }
}
