//! Operation registry and dispatch.
//!
//! Every operation the gateway exposes is an [`OperationDescriptor`]:
//! a name, a required permission, a JSON input schema, and a handler. The
//! [`Dispatcher`] keeps them in registration order and runs every call
//! through the same pipeline:
//!
//! 1. resolve the name (`UnknownOperation`)
//! 2. authorization gate (`PermissionDenied`; nothing is sent to the cluster)
//! 3. argument validation against the schema (`ValidationError`)
//! 4. handler, with errors and panics caught
//! 5. uniform [`Envelope`]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::advisor::Advisor;
use crate::client::PveClient;
use crate::config::Config;
use crate::error::GatewayError;
use crate::rbac::Authorizer;
use crate::resources;
use crate::tasks::{wait_for_task, TaskHandle, TaskStatus};
use crate::tools;
use crate::webhooks::WebhookNotifier;

/// Operation handler. Plain function pointer; all state comes from the context.
pub type Handler =
    for<'a> fn(&'a GatewayContext, &'a Value) -> BoxFuture<'a, Result<Value, GatewayError>>;

pub struct OperationDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub permission: &'static str,
    /// JSON Schema (`type: object`); `required`, property `type`s and
    /// `additionalProperties: false` are enforced.
    pub input_schema: Value,
    pub handler: Handler,
}

impl OperationDescriptor {
    /// MCP tool definition: `{name, description, inputSchema}`.
    pub fn definition(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }

    /// Check `args` against the schema's `required` list, declared properties
    /// and property types. Node and storage names must be plain identifiers.
    pub fn validate(&self, args: &Value) -> Result<(), GatewayError> {
        let Some(obj) = args.as_object() else {
            return Err(GatewayError::validation("arguments", "must be an object"));
        };

        let required = self.input_schema["required"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default();
        for field in required.iter().filter_map(Value::as_str) {
            if obj.get(field).map_or(true, Value::is_null) {
                return Err(GatewayError::validation(field, "missing required field"));
            }
        }

        let properties = self.input_schema["properties"].as_object();
        let closed = self.input_schema["additionalProperties"] == Value::Bool(false);
        for (field, value) in obj {
            if closed && !properties.is_some_and(|p| p.contains_key(field)) {
                return Err(GatewayError::validation(field.as_str(), "unknown field"));
            }
            if value.is_null() {
                continue;
            }
            if PATH_SEGMENT_FIELDS.contains(&field.as_str()) {
                if let Some(s) = value.as_str().filter(|s| !s.trim().is_empty()) {
                    if !is_path_segment(s) {
                        return Err(GatewayError::validation(
                            field.as_str(),
                            "must contain only letters, digits, '.', '-' and '_'",
                        ));
                    }
                }
            }
            let Some(expected) = properties
                .and_then(|p| p.get(field))
                .and_then(|p| p["type"].as_str())
            else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(GatewayError::validation(
                    field.as_str(),
                    format!("expected {expected}"),
                ));
            }
        }
        Ok(())
    }
}

/// Arguments that are interpolated into API paths.
const PATH_SEGMENT_FIELDS: &[&str] = &["node", "storage", "target_node"];

/// A node or storage id: starts with a letter or digit, then letters, digits,
/// `.`, `-` or `_`.
pub(crate) fn is_path_segment(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

/// Everything a handler may touch. Built once at startup and shared.
pub struct GatewayContext {
    pub client: Arc<PveClient>,
    pub advisor: Advisor,
    pub webhooks: WebhookNotifier,
    /// Budget for [`GatewayContext::wait`].
    pub task_timeout: Duration,
}

impl GatewayContext {
    /// Context for `client` with advisor, webhooks and task budget from `config`.
    pub fn from_config(client: Arc<PveClient>, config: &Config) -> Self {
        Self {
            client,
            advisor: Advisor::new(&config.ai),
            webhooks: WebhookNotifier::new(&config.n8n),
            task_timeout: Duration::from_secs(config.mcp.operation_timeout_secs),
        }
    }

    /// Wait for `handle` on `node` and require a successful exit status.
    pub async fn wait(
        &self,
        node: &str,
        handle: TaskHandle,
        operation: &str,
    ) -> Result<TaskStatus, GatewayError> {
        wait_for_task(self.client.as_ref(), node, handle, self.task_timeout)
            .await?
            .into_result(operation)
    }
}

/// Error part of an [`Envelope`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

/// Uniform response: `{success, result?, error?}`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                details: err.details(),
            }),
        }
    }

    pub fn from_result(result: Result<Value, GatewayError>) -> Self {
        match result {
            Ok(v) => Self::ok(v),
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub struct Dispatcher {
    operations: IndexMap<&'static str, OperationDescriptor>,
    authorizer: Authorizer,
    ctx: Arc<GatewayContext>,
}

impl Dispatcher {
    /// Dispatcher with every built-in operation registered.
    pub fn new(ctx: Arc<GatewayContext>, authorizer: Authorizer) -> Self {
        let mut dispatcher = Self::empty(ctx, authorizer);
        for op in tools::all_operations() {
            dispatcher.register(op);
        }
        dispatcher
    }

    pub fn empty(ctx: Arc<GatewayContext>, authorizer: Authorizer) -> Self {
        Self {
            operations: IndexMap::new(),
            authorizer,
            ctx,
        }
    }

    /// Add an operation. A later registration under the same name replaces
    /// the earlier one in place.
    pub fn register(&mut self, op: OperationDescriptor) {
        let name = op.name;
        if self.operations.insert(name, op).is_some() {
            tracing::warn!(operation = name, "Operation registered twice; keeping the latest");
        }
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    pub fn authorizer(&self) -> Authorizer {
        self.authorizer
    }

    pub fn descriptor(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.get(name)
    }

    /// Tool definitions in registration order.
    pub fn list_operations(&self) -> Vec<Value> {
        self.operations
            .values()
            .map(OperationDescriptor::definition)
            .collect()
    }

    /// Run `name` for a caller holding `role`, always producing an envelope.
    pub async fn call_operation(&self, name: &str, args: &Value, role: &str) -> Envelope {
        let started = tokio::time::Instant::now();
        let result = self.try_call(name, args, role).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(operation = name, role, elapsed_ms, "Operation succeeded"),
            Err(e) => tracing::error!(
                operation = name,
                role,
                elapsed_ms,
                code = e.code(),
                error = %e,
                "Operation failed"
            ),
        }
        Envelope::from_result(result)
    }

    async fn try_call(&self, name: &str, args: &Value, role: &str) -> Result<Value, GatewayError> {
        let op = self
            .operations
            .get(name)
            .ok_or_else(|| GatewayError::UnknownOperation(name.to_string()))?;

        if !self.authorizer.check_permission(role, op.permission) {
            return Err(GatewayError::PermissionDenied {
                role: role.to_string(),
                permission: op.permission.to_string(),
            });
        }

        op.validate(args)?;

        match AssertUnwindSafe((op.handler)(&self.ctx, args))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(GatewayError::Internal(format!(
                "handler for {name} panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    pub fn list_resources(&self) -> Vec<Value> {
        resources::definitions()
    }

    /// Read a resource URI for a caller holding `role`.
    pub async fn read_resource(&self, uri: &str, role: &str) -> Envelope {
        let result = async {
            let permission = resources::permission_for(uri)
                .ok_or_else(|| GatewayError::UnknownResource(uri.to_string()))?;
            if !self.authorizer.check_permission(role, permission) {
                return Err(GatewayError::PermissionDenied {
                    role: role.to_string(),
                    permission: permission.to_string(),
                });
            }
            resources::read(&self.ctx, uri).await
        }
        .await;

        if let Err(e) = &result {
            tracing::error!(uri, role, code = e.code(), error = %e, "Resource read failed");
        }
        Envelope::from_result(result)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mock::MockTransport;

    /// Connected context over a mock transport. `version` is pre-scripted.
    pub(crate) async fn mock_context(mock: &Arc<MockTransport>) -> Arc<GatewayContext> {
        mock.respond("version", json!({"version": "8.2.4"}));
        let client = Arc::new(PveClient::new(Arc::clone(mock)));
        assert!(client.connect().await);
        Arc::new(GatewayContext {
            client,
            advisor: Advisor::disabled(),
            webhooks: WebhookNotifier::disabled(),
            task_timeout: Duration::from_secs(300),
        })
    }

    pub(crate) async fn dispatcher(mock: &Arc<MockTransport>) -> Dispatcher {
        Dispatcher::new(mock_context(mock).await, Authorizer::new(true))
    }

    fn panicking<'a>(
        _ctx: &'a GatewayContext,
        _args: &'a Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>> {
        async {
            if true {
                panic!("boom");
            }
            Ok(Value::Null)
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_operation() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;

        let env = d.call_operation("reboot_universe", &json!({}), "admin").await;
        assert!(!env.success);
        let err = env.error.unwrap();
        assert_eq!(err.code, "UnknownOperation");
        assert_eq!(err.details["operation"], "reboot_universe");
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_issues_no_remote_call() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let before = mock.total_calls();

        let env = d
            .call_operation("start_vm", &json!({"node": "pve1", "vmid": 101}), "viewer")
            .await;
        assert!(!env.success);
        let err = env.error.unwrap();
        assert_eq!(err.code, "PermissionDenied");
        assert_eq!(err.details["required_permission"], "vm:start");
        assert_eq!(mock.total_calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_required_field_is_named() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let before = mock.total_calls();

        let env = d
            .call_operation("start_vm", &json!({"node": "pve1"}), "operator")
            .await;
        let err = env.error.unwrap();
        assert_eq!(err.code, "ValidationError");
        assert_eq!(err.details["field"], "vmid");
        assert_eq!(mock.total_calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_type_and_null_are_rejected() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;

        let env = d
            .call_operation("start_vm", &json!({"node": "pve1", "vmid": "101"}), "admin")
            .await;
        assert_eq!(env.error.unwrap().details["field"], "vmid");

        let env = d
            .call_operation("start_vm", &json!({"node": null, "vmid": 101}), "admin")
            .await;
        assert_eq!(env.error.unwrap().details["field"], "node");

        let env = d.call_operation("list_vms", &json!([1, 2]), "admin").await;
        assert_eq!(env.error.unwrap().code, "ValidationError");
    }

    #[tokio::test(start_paused = true)]
    async fn undeclared_field_is_rejected() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let before = mock.total_calls();

        let env = d
            .call_operation(
                "stop_vm",
                &json!({"node": "pve1", "vmid": 101, "forse": true}),
                "operator",
            )
            .await;
        let err = env.error.unwrap();
        assert_eq!(err.code, "ValidationError");
        assert_eq!(err.details["field"], "forse");
        assert_eq!(mock.total_calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn node_cannot_smuggle_path_or_query() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let before = mock.total_calls();

        for node in ["pve1/status?command=reboot#", "..", "pve1#", "a b"] {
            let env = d
                .call_operation("start_vm", &json!({"node": node, "vmid": 101}), "operator")
                .await;
            let err = env.error.unwrap();
            assert_eq!(err.code, "ValidationError", "{node}");
            assert_eq!(err.details["field"], "node");
        }

        let env = d
            .call_operation(
                "migrate_vm",
                &json!({"node": "pve1", "vmid": 101, "target_node": "pve2/../../access"}),
                "admin",
            )
            .await;
        assert_eq!(env.error.unwrap().details["field"], "target_node");

        let env = d
            .call_operation(
                "get_storage_content",
                &json!({"node": "pve1", "storage": "local?content=iso"}),
                "viewer",
            )
            .await;
        assert_eq!(env.error.unwrap().details["field"], "storage");

        assert_eq!(mock.total_calls(), before);
    }

    #[test]
    fn path_segments() {
        for ok in ["pve1", "pve-node.lan", "local-lvm", "local_zfs", "9node"] {
            assert!(is_path_segment(ok), "{ok}");
        }
        for bad in ["", ".", "..", "-x", "pve1/qemu", "pve1?x=1", "pve1#", "pve 1", "pvé"] {
            assert!(!is_path_segment(bad), "{bad}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_vm_end_to_end() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond("guest_power", json!("UPID:123"))
            .push_ok("task_status", json!({"status": "running"}))
            .push_ok("task_status", json!({"status": "running"}))
            .push_ok("task_status", json!({"status": "stopped", "exitstatus": "OK"}));

        let env = d
            .call_operation("start_vm", &json!({"node": "pve1", "vmid": 101}), "operator")
            .await;

        assert!(env.success, "{:?}", env.error);
        let result = env.result.unwrap();
        assert_eq!(result["vmid"], 101);
        assert_eq!(result["node"], "pve1");
        assert_eq!(result["status"], "started");
        assert_eq!(result["task_id"], "UPID:123");
        assert_eq!(mock.calls("task_status"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_remote_call_becomes_operation_failed() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.fail("guest_power", 500, "VM is locked");

        let env = d
            .call_operation("start_vm", &json!({"node": "pve1", "vmid": 101}), "admin")
            .await;
        let err = env.error.unwrap();
        assert_eq!(err.code, "OperationFailed");
        assert!(err.message.contains("VM is locked"));
        assert_eq!(mock.calls("guest_power"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rbac_disabled_allows_any_role() {
        let mock = MockTransport::new();
        let ctx = mock_context(&mock).await;
        let d = Dispatcher::new(ctx, Authorizer::new(false));
        mock.respond("list_nodes", json!([]));

        let env = d.call_operation("list_nodes", &json!({}), "nobody").await;
        assert!(env.success);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_is_contained() {
        let mock = MockTransport::new();
        let mut d = Dispatcher::empty(mock_context(&mock).await, Authorizer::new(true));
        d.register(OperationDescriptor {
            name: "explode",
            description: "Always panics.",
            permission: "system:monitor",
            input_schema: json!({"type": "object", "properties": {}}),
            handler: panicking,
        });

        let env = d.call_operation("explode", &json!({}), "viewer").await;
        let err = env.error.unwrap();
        assert_eq!(err.code, "InternalError");
        assert!(err.message.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_listed_in_registration_order() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let names: Vec<String> = d
            .list_operations()
            .iter()
            .map(|t| t["name"].as_str().unwrap_or_default().to_string())
            .collect();

        assert_eq!(names.len(), 30);
        assert_eq!(names[0], "list_vms");
        assert!(names.contains(&"analyze_vm_performance".to_string()));
        for tool in d.list_operations() {
            assert_eq!(tool["inputSchema"]["type"], "object");
        }
    }

    #[test]
    fn envelope_omits_absent_parts() {
        let ok = Envelope::ok(json!({"a": 1})).to_value();
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());

        let err = Envelope::from_error(&GatewayError::Connection("down".into())).to_value();
        assert_eq!(err["success"], false);
        assert!(err.get("result").is_none());
        assert!(err["error"].get("details").is_none());
        assert_eq!(err["error"]["code"], "ConnectionError");
    }
}
