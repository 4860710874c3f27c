//! Remote operations and the HTTP transport that executes them.
//!
//! A [`RemoteCall`] is a typed value describing one Proxmox VE API request:
//! the kind of call plus its parameters. It maps to an HTTP method, a path
//! under `/api2/json`, and form/query parameters via [`RemoteCall::request`].
//!
//! [`Transport`] is the seam between the retrying client and the wire.
//! [`HttpTransport`] is the production implementation on top of
//! `reqwest::Client`; tests substitute [`MockTransport`](crate::mock::MockTransport).
//!
//! ## Authentication
//!
//! Proxmox uses ticket authentication: `POST /access/ticket` with the
//! username and password returns a ticket (sent back as the `PVEAuthCookie`
//! cookie) and a CSRF token (required on every non-GET request). The ticket
//! is fetched lazily on the first call and renewed once when the server
//! answers 401.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `errors` or `message` field in the
//! JSON body. If parsing fails, the raw response body is used as the message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::ConnectionSettings;
use crate::error::GatewayError;

/// Form or query parameters for a remote call.
pub type Params = Vec<(String, String)>;

/// Guest type: QEMU virtual machine or LXC container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    /// Path segment used by the Proxmox API (`qemu` / `lxc`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }
}

/// Power transitions accepted by `/status/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    /// Hard stop.
    Stop,
    /// ACPI shutdown.
    Shutdown,
}

impl PowerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// A fully resolved request: method, path below `/api2/json`, parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub params: Params,
}

/// One Proxmox VE API call, as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Version,
    ListNodes,
    NodeStatus { node: String },
    NodeServices { node: String },
    NodeNetwork { node: String },
    CreateNetworkInterface { node: String, params: Params },
    ListGuests { node: String, kind: GuestKind },
    GuestConfig { node: String, kind: GuestKind, vmid: u32 },
    GuestStatus { node: String, kind: GuestKind, vmid: u32 },
    CreateGuest { node: String, kind: GuestKind, vmid: u32, params: Params },
    GuestPower { node: String, kind: GuestKind, vmid: u32, action: PowerAction },
    DeleteGuest { node: String, kind: GuestKind, vmid: u32, purge: bool },
    CloneGuest { node: String, kind: GuestKind, vmid: u32, newid: u32, params: Params },
    MigrateVm { node: String, vmid: u32, target: String, params: Params },
    ListStorage { node: Option<String> },
    StorageContent { node: String, storage: String, content: Option<String> },
    StorageStatus { node: String, storage: String },
    ClusterStatus,
    ClusterResources { kind: Option<String> },
    HaResources,
    Backup { node: String, params: Params },
    TaskStatus { node: String, upid: String },
}

impl RemoteCall {
    /// Short name used in log lines and error details.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::ListNodes => "list_nodes",
            Self::NodeStatus { .. } => "node_status",
            Self::NodeServices { .. } => "node_services",
            Self::NodeNetwork { .. } => "node_network",
            Self::CreateNetworkInterface { .. } => "create_network_interface",
            Self::ListGuests { .. } => "list_guests",
            Self::GuestConfig { .. } => "guest_config",
            Self::GuestStatus { .. } => "guest_status",
            Self::CreateGuest { .. } => "create_guest",
            Self::GuestPower { .. } => "guest_power",
            Self::DeleteGuest { .. } => "delete_guest",
            Self::CloneGuest { .. } => "clone_guest",
            Self::MigrateVm { .. } => "migrate_vm",
            Self::ListStorage { .. } => "list_storage",
            Self::StorageContent { .. } => "storage_content",
            Self::StorageStatus { .. } => "storage_status",
            Self::ClusterStatus => "cluster_status",
            Self::ClusterResources { .. } => "cluster_resources",
            Self::HaResources => "ha_resources",
            Self::Backup { .. } => "backup",
            Self::TaskStatus { .. } => "task_status",
        }
    }

    /// Resolve to method, path and parameters.
    pub fn request(&self) -> RemoteRequest {
        use Method::{Delete, Get, Post};

        let (method, path, params) = match self {
            Self::Version => (Get, "/version".to_string(), Vec::new()),
            Self::ListNodes => (Get, "/nodes".to_string(), Vec::new()),
            Self::NodeStatus { node } => (Get, format!("/nodes/{node}/status"), Vec::new()),
            Self::NodeServices { node } => (Get, format!("/nodes/{node}/services"), Vec::new()),
            Self::NodeNetwork { node } => (Get, format!("/nodes/{node}/network"), Vec::new()),
            Self::CreateNetworkInterface { node, params } => {
                (Post, format!("/nodes/{node}/network"), params.clone())
            }
            Self::ListGuests { node, kind } => {
                (Get, format!("/nodes/{node}/{}", kind.as_str()), Vec::new())
            }
            Self::GuestConfig { node, kind, vmid } => (
                Get,
                format!("/nodes/{node}/{}/{vmid}/config", kind.as_str()),
                Vec::new(),
            ),
            Self::GuestStatus { node, kind, vmid } => (
                Get,
                format!("/nodes/{node}/{}/{vmid}/status/current", kind.as_str()),
                Vec::new(),
            ),
            Self::CreateGuest {
                node,
                kind,
                vmid,
                params,
            } => {
                let mut all = vec![("vmid".to_string(), vmid.to_string())];
                all.extend(params.iter().cloned());
                (Post, format!("/nodes/{node}/{}", kind.as_str()), all)
            }
            Self::GuestPower {
                node,
                kind,
                vmid,
                action,
            } => (
                Post,
                format!(
                    "/nodes/{node}/{}/{vmid}/status/{}",
                    kind.as_str(),
                    action.as_str()
                ),
                Vec::new(),
            ),
            Self::DeleteGuest {
                node,
                kind,
                vmid,
                purge,
            } => (
                Delete,
                format!("/nodes/{node}/{}/{vmid}", kind.as_str()),
                vec![("purge".to_string(), u8::from(*purge).to_string())],
            ),
            Self::CloneGuest {
                node,
                kind,
                vmid,
                newid,
                params,
            } => {
                let mut all = vec![("newid".to_string(), newid.to_string())];
                all.extend(params.iter().cloned());
                (
                    Post,
                    format!("/nodes/{node}/{}/{vmid}/clone", kind.as_str()),
                    all,
                )
            }
            Self::MigrateVm {
                node,
                vmid,
                target,
                params,
            } => {
                let mut all = vec![("target".to_string(), target.clone())];
                all.extend(params.iter().cloned());
                (Post, format!("/nodes/{node}/qemu/{vmid}/migrate"), all)
            }
            Self::ListStorage { node: None } => (Get, "/storage".to_string(), Vec::new()),
            Self::ListStorage { node: Some(node) } => {
                (Get, format!("/nodes/{node}/storage"), Vec::new())
            }
            Self::StorageContent {
                node,
                storage,
                content,
            } => (
                Get,
                format!("/nodes/{node}/storage/{storage}/content"),
                content
                    .iter()
                    .map(|c| ("content".to_string(), c.clone()))
                    .collect(),
            ),
            Self::StorageStatus { node, storage } => (
                Get,
                format!("/nodes/{node}/storage/{storage}/status"),
                Vec::new(),
            ),
            Self::ClusterStatus => (Get, "/cluster/status".to_string(), Vec::new()),
            Self::ClusterResources { kind } => (
                Get,
                "/cluster/resources".to_string(),
                kind.iter()
                    .map(|k| ("type".to_string(), k.clone()))
                    .collect(),
            ),
            Self::HaResources => (Get, "/cluster/ha/resources".to_string(), Vec::new()),
            Self::Backup { node, params } => {
                (Post, format!("/nodes/{node}/vzdump"), params.clone())
            }
            Self::TaskStatus { node, upid } => {
                (Get, format!("/nodes/{node}/tasks/{upid}/status"), Vec::new())
            }
        };

        RemoteRequest {
            method,
            path,
            params,
        }
    }
}

/// Executes remote calls. Implementations must be safe for concurrent use:
/// the client shares one transport across all in-flight operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one call, returning the unwrapped `data` payload.
    async fn execute(&self, call: &RemoteCall) -> Result<Value, TransportError>;
}

/// Builds a [`Transport`] for [`PveClient::connect`](crate::client::PveClient::connect).
pub trait Connector: Send + Sync {
    /// Endpoint description for log lines.
    fn endpoint(&self) -> String;

    fn open(&self) -> Result<Arc<dyn Transport>, GatewayError>;
}

/// Opens [`HttpTransport`]s from [`ConnectionSettings`].
pub struct HttpConnector {
    settings: ConnectionSettings,
}

impl HttpConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl Connector for HttpConnector {
    fn endpoint(&self) -> String {
        self.settings.base_url()
    }

    fn open(&self) -> Result<Arc<dyn Transport>, GatewayError> {
        Ok(Arc::new(HttpTransport::new(&self.settings)?))
    }
}

/// Ticket and CSRF token returned by `POST /access/ticket`.
#[derive(Clone)]
struct AuthTicket {
    ticket: String,
    csrf_token: String,
}

/// HTTP transport for one Proxmox VE endpoint.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    auth: RwLock<Option<AuthTicket>>,
}

impl HttpTransport {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, GatewayError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::HeaderName::from_static("x-pve-client"),
            reqwest::header::HeaderValue::from_static("pve-mcp"),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            auth: RwLock::new(None),
        })
    }

    /// `POST /access/ticket`: exchange credentials for a ticket.
    async fn login(&self) -> Result<AuthTicket, TransportError> {
        let resp = self
            .http
            .post(format!("{}/access/ticket", self.base_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(TransportError::Request)?;
        let data = Self::handle_response(resp).await?;

        let ticket = data["ticket"]
            .as_str()
            .ok_or_else(|| TransportError::Protocol("login response has no ticket".into()))?;
        let csrf_token = data["CSRFPreventionToken"].as_str().unwrap_or_default();
        Ok(AuthTicket {
            ticket: ticket.to_string(),
            csrf_token: csrf_token.to_string(),
        })
    }

    async fn ticket(&self) -> Result<AuthTicket, TransportError> {
        if let Some(t) = self.auth.read().await.as_ref() {
            return Ok(t.clone());
        }
        let fresh = self.login().await?;
        *self.auth.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    async fn send(
        &self,
        request: &RemoteRequest,
        auth: &AuthTicket,
    ) -> Result<reqwest::Response, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let builder = match request.method {
            Method::Get => self.http.get(url).query(&request.params),
            Method::Delete => self.http.delete(url).query(&request.params),
            Method::Post => self.http.post(url).form(&request.params),
        };
        let builder = builder.header(
            reqwest::header::COOKIE,
            format!("PVEAuthCookie={}", auth.ticket),
        );
        let builder = if request.method == Method::Get {
            builder
        } else {
            builder.header("CSRFPreventionToken", &auth.csrf_token)
        };
        builder.send().await.map_err(TransportError::Request)
    }

    /// Parse an API response. Returns the `data` field on success, or a
    /// [`TransportError`] with the error message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, TransportError> {
        let status = resp.status();
        let body = resp.text().await.map_err(TransportError::Request)?;

        if status.is_success() {
            let mut envelope: Value = serde_json::from_str(&body)
                .map_err(|e| TransportError::Protocol(format!("Invalid JSON from API: {e}")))?;
            Ok(envelope["data"].take())
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("errors")
                        .filter(|e| !e.is_null())
                        .map(Value::to_string)
                        .or_else(|| v["message"].as_str().map(String::from))
                })
                .unwrap_or_else(|| {
                    let reason = status.canonical_reason().unwrap_or("error");
                    if body.trim().is_empty() {
                        reason.to_string()
                    } else {
                        format!("{reason}: {}", body.trim())
                    }
                });
            Err(TransportError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, call: &RemoteCall) -> Result<Value, TransportError> {
        let request = call.request();
        let auth = self.ticket().await?;
        let resp = self.send(&request, &auth).await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Ticket expired (2h lifetime); log in once more and replay
            *self.auth.write().await = None;
            let auth = self.ticket().await?;
            let resp = self.send(&request, &auth).await?;
            return Self::handle_response(resp).await;
        }

        Self::handle_response(resp).await
    }
}

/// Errors returned by a single [`Transport::execute`] attempt.
#[derive(Debug)]
pub enum TransportError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The API returned a non-2xx HTTP status.
    Status { status: u16, message: String },
    /// The response body was not what the API contract promises.
    Protocol(String),
}

impl TransportError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::Status { status: 404, .. })
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Request(e) => write!(f, "HTTP request failed: {}", e),
            TransportError::Status { status, message } => {
                write!(f, "API error (HTTP {}): {}", status, message)
            }
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}
