//! Long-running task polling.
//!
//! Mutating Proxmox calls return immediately with a UPID, the handle of an
//! asynchronous task running on one node. [`wait_for_task`] polls the task's
//! status every [`POLL_INTERVAL`] until it leaves the `running` state or the
//! timeout budget is spent. A timeout does not abort the remote task; it
//! keeps running and can be inspected later with the same UPID.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::client::PveClient;
use crate::error::GatewayError;
use crate::transport::TransportError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque task identifier (UPID). Consumed by [`wait_for_task`], so a
/// handle is polled at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(upid: impl Into<String>) -> Self {
        Self(upid.into())
    }

    /// Extract the UPID a mutating call returns as its `data`.
    pub fn from_response(data: Value) -> Result<Self, GatewayError> {
        match data {
            Value::String(upid) if !upid.is_empty() => Ok(Self(upid)),
            other => Err(GatewayError::Remote(TransportError::Protocol(format!(
                "expected a task id, got {other}"
            )))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal status of a finished task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub upid: String,
    /// `stopped` for every finished task.
    pub status: String,
    /// `OK` on success, an error message otherwise.
    pub exitstatus: Option<String>,
    pub raw: Value,
}

impl TaskStatus {
    fn from_raw(upid: &str, raw: Value) -> Self {
        Self {
            upid: upid.to_string(),
            status: raw["status"].as_str().unwrap_or_default().to_string(),
            exitstatus: raw["exitstatus"].as_str().map(String::from),
            raw,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn succeeded(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }

    /// Convert a failed exit status into [`GatewayError::OperationFailed`].
    pub fn into_result(self, operation: &str) -> Result<Self, GatewayError> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(GatewayError::OperationFailed {
                operation: operation.to_string(),
                attempts: 1,
                last_error: format!(
                    "task {} finished with exit status {}",
                    self.upid,
                    self.exitstatus.as_deref().unwrap_or("unknown")
                ),
            })
        }
    }
}

/// Anything that can report the current status of a task.
#[async_trait]
pub trait TaskStatusSource: Send + Sync {
    async fn task_status(&self, node: &str, upid: &str) -> Result<Value, GatewayError>;
}

#[async_trait]
impl TaskStatusSource for PveClient {
    async fn task_status(&self, node: &str, upid: &str) -> Result<Value, GatewayError> {
        self.task_status_raw(node, upid).await
    }
}

/// Poll until the task is no longer `running`, or fail with
/// [`GatewayError::Timeout`] once `timeout` has elapsed.
///
/// Any status other than `running` is terminal. Status fetch errors are
/// returned as-is (they have already been retried by the source).
pub async fn wait_for_task(
    source: &dyn TaskStatusSource,
    node: &str,
    handle: TaskHandle,
    timeout: Duration,
) -> Result<TaskStatus, GatewayError> {
    let start = Instant::now();
    let upid = handle.into_string();

    loop {
        let raw = source.task_status(node, &upid).await?;
        let status = TaskStatus::from_raw(&upid, raw);
        if !status.is_running() {
            tracing::debug!(
                upid = %upid,
                exitstatus = ?status.exitstatus,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Task finished"
            );
            return Ok(status);
        }

        if start.elapsed() > timeout {
            tracing::warn!(upid = %upid, timeout_secs = timeout.as_secs(), "Task wait timed out");
            return Err(GatewayError::Timeout {
                upid,
                timeout_secs: timeout.as_secs(),
            });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
