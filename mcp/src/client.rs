//! Retrying client for one Proxmox VE endpoint.
//!
//! [`PveClient`] owns the connection: an installed [`Transport`] (or none),
//! the timestamp of the last successful liveness probe, and a small cache of
//! node names. Every remote call goes through
//! [`execute_with_retry`](PveClient::execute_with_retry); the domain
//! accessors below are single-call wrappers around it and carry no retry or
//! error logic of their own. All responses are returned as
//! `serde_json::Value`; the tools layer shapes them for the caller.
//!
//! No remote call is attempted while the connection is unset; such calls
//! fail immediately with [`GatewayError::Connection`].

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::retry::{retry, RetryPolicy};
use crate::tasks::TaskHandle;
use crate::transport::{Connector, GuestKind, Params, PowerAction, RemoteCall, Transport};

/// A successful liveness probe is trusted for this long.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(300);

pub struct PveClient {
    connector: Box<dyn Connector>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    last_liveness_check: Mutex<Option<Instant>>,
    node_cache: Mutex<Option<Vec<String>>>,
    policy: RetryPolicy,
}

impl PveClient {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            transport: RwLock::new(None),
            last_liveness_check: Mutex::new(None),
            node_cache: Mutex::new(None),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Open a session and probe it with `GET /version`.
    ///
    /// Returns `false` (and leaves the connection unset) if the transport
    /// cannot be built or the probe fails after retries.
    pub async fn connect(&self) -> bool {
        let transport = match self.connector.open() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(endpoint = %self.endpoint(), error = %e, "Failed to open connection");
                return false;
            }
        };

        let probe = RemoteCall::Version;
        match retry(&self.policy, probe.label(), || transport.execute(&probe)).await {
            Ok(version) => {
                *self.transport.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
                self.mark_alive();
                tracing::info!(
                    endpoint = %self.endpoint(),
                    version = %version["version"].as_str().unwrap_or("unknown"),
                    "Connected to Proxmox VE"
                );
                true
            }
            Err(e) => {
                tracing::error!(endpoint = %self.endpoint(), error = %e, "Connection probe failed");
                false
            }
        }
    }

    /// Drop the session and every cached lookup. Idempotent.
    pub fn disconnect(&self) {
        let was_connected = self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        *self.node_cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .last_liveness_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if was_connected {
            tracing::info!(endpoint = %self.endpoint(), "Disconnected from Proxmox VE");
        }
    }

    /// Execute one remote call through the retry policy.
    pub async fn execute_with_retry(&self, call: RemoteCall) -> Result<Value, GatewayError> {
        // Clone the Arc out so no lock is held across the await
        let transport = self
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GatewayError::Connection("not connected to Proxmox VE".into()))?;

        retry(&self.policy, call.label(), || transport.execute(&call)).await
    }

    /// `true` if a probe succeeded within [`LIVENESS_WINDOW`]; otherwise
    /// re-probes. Never errors.
    pub async fn validate_connection(&self) -> bool {
        let fresh = self
            .last_liveness_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < LIVENESS_WINDOW);
        if fresh {
            return true;
        }

        match self.execute_with_retry(RemoteCall::Version).await {
            Ok(_) => {
                self.mark_alive();
                true
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint(), error = %e, "Connection validation failed");
                false
            }
        }
    }

    fn mark_alive(&self) {
        *self
            .last_liveness_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// `GET /version`
    pub async fn version(&self) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::Version).await
    }

    /// `GET /nodes`; also refreshes the cached names of online nodes.
    pub async fn list_nodes(&self) -> Result<Vec<Value>, GatewayError> {
        let nodes = as_list(self.execute_with_retry(RemoteCall::ListNodes).await?);
        let online: Vec<String> = nodes
            .iter()
            .filter(|n| n["status"].as_str() != Some("offline"))
            .filter_map(|n| n["node"].as_str().map(String::from))
            .collect();
        *self.node_cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(online);
        Ok(nodes)
    }

    /// Names of nodes not reported offline, from cache when available.
    async fn node_names(&self) -> Result<Vec<String>, GatewayError> {
        let cached = self
            .node_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(names) = cached {
            return Ok(names);
        }
        self.list_nodes().await?;
        Ok(self
            .node_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default())
    }

    pub async fn node_status(&self, node: &str) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::NodeStatus { node: node.into() })
            .await
    }

    pub async fn node_services(&self, node: &str) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::NodeServices { node: node.into() })
            .await
    }

    // ── Guests (VMs and containers) ────────────────────────────────

    /// Guests on `node`, or on every node when `None`. Each entry is
    /// annotated with its `node`.
    pub async fn list_guests(
        &self,
        kind: GuestKind,
        node: Option<&str>,
    ) -> Result<Vec<Value>, GatewayError> {
        let nodes = match node {
            Some(n) => vec![n.to_string()],
            None => self.node_names().await?,
        };

        let mut guests = Vec::new();
        for node in nodes {
            let listed = self
                .execute_with_retry(RemoteCall::ListGuests {
                    node: node.clone(),
                    kind,
                })
                .await?;
            for mut guest in as_list(listed) {
                if let Value::Object(map) = &mut guest {
                    map.insert("node".into(), Value::String(node.clone()));
                }
                guests.push(guest);
            }
        }
        Ok(guests)
    }

    pub async fn guest_config(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::GuestConfig {
            node: node.into(),
            kind,
            vmid,
        })
        .await
    }

    pub async fn guest_status(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::GuestStatus {
            node: node.into(),
            kind,
            vmid,
        })
        .await
    }

    pub async fn create_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        params: Params,
    ) -> Result<TaskHandle, GatewayError> {
        let call = RemoteCall::CreateGuest {
            node: node.into(),
            kind,
            vmid,
            params,
        };
        TaskHandle::from_response(self.execute_with_retry(call).await?)
    }

    pub async fn start_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<TaskHandle, GatewayError> {
        self.power(node, kind, vmid, PowerAction::Start).await
    }

    /// Hard stop when `force`, otherwise an ACPI shutdown.
    pub async fn stop_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        force: bool,
    ) -> Result<TaskHandle, GatewayError> {
        let action = if force {
            PowerAction::Stop
        } else {
            PowerAction::Shutdown
        };
        self.power(node, kind, vmid, action).await
    }

    async fn power(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        action: PowerAction,
    ) -> Result<TaskHandle, GatewayError> {
        let call = RemoteCall::GuestPower {
            node: node.into(),
            kind,
            vmid,
            action,
        };
        TaskHandle::from_response(self.execute_with_retry(call).await?)
    }

    pub async fn delete_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        purge: bool,
    ) -> Result<TaskHandle, GatewayError> {
        let call = RemoteCall::DeleteGuest {
            node: node.into(),
            kind,
            vmid,
            purge,
        };
        TaskHandle::from_response(self.execute_with_retry(call).await?)
    }

    pub async fn clone_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        newid: u32,
        params: Params,
    ) -> Result<TaskHandle, GatewayError> {
        let call = RemoteCall::CloneGuest {
            node: node.into(),
            kind,
            vmid,
            newid,
            params,
        };
        TaskHandle::from_response(self.execute_with_retry(call).await?)
    }

    pub async fn migrate_vm(
        &self,
        node: &str,
        vmid: u32,
        target: &str,
        params: Params,
    ) -> Result<TaskHandle, GatewayError> {
        let call = RemoteCall::MigrateVm {
            node: node.into(),
            vmid,
            target: target.into(),
            params,
        };
        TaskHandle::from_response(self.execute_with_retry(call).await?)
    }

    // ── Storage ────────────────────────────────────────────────────

    /// Cluster-wide storage definitions, or the storages visible on `node`.
    pub async fn list_storage(&self, node: Option<&str>) -> Result<Vec<Value>, GatewayError> {
        let call = RemoteCall::ListStorage {
            node: node.map(String::from),
        };
        Ok(as_list(self.execute_with_retry(call).await?))
    }

    pub async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: Option<&str>,
    ) -> Result<Vec<Value>, GatewayError> {
        let call = RemoteCall::StorageContent {
            node: node.into(),
            storage: storage.into(),
            content: content.map(String::from),
        };
        Ok(as_list(self.execute_with_retry(call).await?))
    }

    pub async fn storage_status(&self, node: &str, storage: &str) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::StorageStatus {
            node: node.into(),
            storage: storage.into(),
        })
        .await
    }

    // ── Cluster ────────────────────────────────────────────────────

    pub async fn cluster_status(&self) -> Result<Vec<Value>, GatewayError> {
        Ok(as_list(
            self.execute_with_retry(RemoteCall::ClusterStatus).await?,
        ))
    }

    /// `GET /cluster/resources`, optionally filtered by `type` (vm, storage, node, sdn).
    pub async fn cluster_resources(&self, kind: Option<&str>) -> Result<Vec<Value>, GatewayError> {
        let call = RemoteCall::ClusterResources {
            kind: kind.map(String::from),
        };
        Ok(as_list(self.execute_with_retry(call).await?))
    }

    pub async fn ha_resources(&self) -> Result<Vec<Value>, GatewayError> {
        Ok(as_list(
            self.execute_with_retry(RemoteCall::HaResources).await?,
        ))
    }

    // ── Network ────────────────────────────────────────────────────

    pub async fn network_config(&self, node: &str) -> Result<Vec<Value>, GatewayError> {
        let call = RemoteCall::NodeNetwork { node: node.into() };
        Ok(as_list(self.execute_with_retry(call).await?))
    }

    /// Stage a new interface. Takes effect after a network reload on the node.
    pub async fn create_network_interface(
        &self,
        node: &str,
        params: Params,
    ) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::CreateNetworkInterface {
            node: node.into(),
            params,
        })
        .await
    }

    // ── Backup ─────────────────────────────────────────────────────

    /// `POST /nodes/{node}/vzdump`
    pub async fn backup(&self, node: &str, params: Params) -> Result<TaskHandle, GatewayError> {
        let call = RemoteCall::Backup {
            node: node.into(),
            params,
        };
        TaskHandle::from_response(self.execute_with_retry(call).await?)
    }

    /// Restore an archive into a new guest `vmid`.
    pub async fn restore(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        params: Params,
    ) -> Result<TaskHandle, GatewayError> {
        self.create_guest(node, kind, vmid, params).await
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// `GET /nodes/{node}/tasks/{upid}/status`
    pub async fn task_status_raw(&self, node: &str, upid: &str) -> Result<Value, GatewayError> {
        self.execute_with_retry(RemoteCall::TaskStatus {
            node: node.into(),
            upid: upid.into(),
        })
        .await
    }
}

/// List endpoints return an array; treat `null` as empty.
fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    fn client(mock: &Arc<MockTransport>) -> PveClient {
        PveClient::new(Arc::clone(mock))
    }

    #[tokio::test(start_paused = true)]
    async fn calls_fail_fast_when_disconnected() {
        let mock = MockTransport::new();
        let client = client(&mock);

        let err = client.list_nodes().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_probes_version() {
        let mock = MockTransport::new();
        mock.respond("version", json!({"version": "8.2.4"}));
        let client = client(&mock);

        assert!(client.connect().await);
        assert!(client.is_connected());
        assert_eq!(mock.calls("version"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_leaves_connection_unset() {
        let mock = MockTransport::new();
        mock.fail("version", 401, "authentication failure");
        let client = client(&mock);

        assert!(!client.connect().await);
        assert!(!client.is_connected());
        assert_eq!(mock.calls("version"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_is_cached_within_window() {
        let mock = MockTransport::new();
        mock.respond("version", json!({"version": "8.2.4"}));
        let client = client(&mock);
        assert!(client.connect().await);
        // Let the connect-time check expire so the next call must probe
        tokio::time::advance(LIVENESS_WINDOW + Duration::from_secs(1)).await;

        assert!(client.validate_connection().await);
        assert!(client.validate_connection().await);
        // One probe from connect, one from the first validation
        assert_eq!(mock.calls("version"), 2);

        tokio::time::advance(LIVENESS_WINDOW).await;
        assert!(client.validate_connection().await);
        assert_eq!(mock.calls("version"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_reports_false_instead_of_erroring() {
        let mock = MockTransport::new();
        mock.push_ok("version", json!({"version": "8.2.4"}))
            .fail("version", 500, "down");
        let client = client(&mock);
        assert!(client.connect().await);
        tokio::time::advance(LIVENESS_WINDOW).await;

        assert!(!client.validate_connection().await);
        // Still connected: a failed check does not tear the session down
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_state_and_is_idempotent() {
        let mock = MockTransport::new();
        mock.respond("version", json!({}))
            .respond("list_nodes", json!([{"node": "pve1", "status": "online"}]));
        let client = client(&mock);
        assert!(client.connect().await);
        client.list_nodes().await.unwrap();

        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
        assert!(!client.validate_connection().await);
        // The failed validation never reached the transport
        assert_eq!(mock.calls("version"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_fan_out_annotates_node() {
        let mock = MockTransport::new();
        mock.respond("version", json!({}))
            .respond(
                "list_nodes",
                json!([
                    {"node": "pve1", "status": "online"},
                    {"node": "pve2", "status": "offline"}
                ]),
            )
            .respond("list_guests", json!([{"vmid": 101, "name": "web"}]));
        let client = client(&mock);
        assert!(client.connect().await);

        let guests = client.list_guests(GuestKind::Qemu, None).await.unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0]["node"], "pve1");
        assert_eq!(mock.calls("list_guests"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_force_is_shutdown() {
        let mock = MockTransport::new();
        mock.respond("version", json!({}))
            .respond("guest_power", json!("UPID:pve1:0001:qmshutdown"));
        let client = client(&mock);
        assert!(client.connect().await);

        let handle = client
            .stop_guest("pve1", GuestKind::Qemu, 101, false)
            .await
            .unwrap();
        assert_eq!(handle.as_str(), "UPID:pve1:0001:qmshutdown");
        assert!(mock.recorded().contains(&RemoteCall::GuestPower {
            node: "pve1".into(),
            kind: GuestKind::Qemu,
            vmid: 101,
            action: PowerAction::Shutdown,
        }));
    }
}
