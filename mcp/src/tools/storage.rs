//! Storage listing, status and content.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::{node_property, optional_str, percent, required_str, schema};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "list_storages",
            description: "List storages. Without `node`, returns the cluster-wide storage definitions; with `node`, the storages active on that node including usage.",
            permission: "storage:monitor",
            input_schema: schema(
                json!({ "node": { "type": "string", "description": "Node to report usage for." } }),
                &[],
            ),
            handler: list_storages,
        },
        OperationDescriptor {
            name: "get_storage_status",
            description: "Get capacity and usage of one storage on a node.",
            permission: "storage:monitor",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "storage": { "type": "string", "description": "Storage id, e.g. \"local-lvm\"." }
                }),
                &["node", "storage"],
            ),
            handler: get_storage_status,
        },
        OperationDescriptor {
            name: "get_storage_content",
            description: "List volumes on a storage: disk images, ISOs, container templates, backups.",
            permission: "storage:monitor",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "storage": { "type": "string", "description": "Storage id." },
                    "content": { "type": "string", "enum": ["images", "rootdir", "iso", "vztmpl", "backup", "snippets"], "description": "Only list volumes of this content type." }
                }),
                &["node", "storage"],
            ),
            handler: get_storage_content,
        },
    ]
}

/// Add `usage_percent` when the entry carries `used`/`total`.
pub(crate) fn with_usage(mut storage: Value) -> Value {
    if storage.get("total").is_some() {
        let pct = percent(&storage["used"], &storage["total"]);
        storage["usage_percent"] = json!(pct);
    }
    storage
}

fn list_storages<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = optional_str(args, "node");
        let storages: Vec<Value> = ctx
            .client
            .list_storage(node)
            .await?
            .into_iter()
            .map(with_usage)
            .collect();
        Ok(json!({
            "node": node,
            "storages": storages,
            "total": storages.len(),
        }))
    }
    .boxed()
}

fn get_storage_status<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let storage = required_str(args, "storage")?;
        let status = ctx
            .client
            .storage_status(node, storage)
            .await
            .map_err(|e| match &e {
                GatewayError::OperationFailed { last_error, .. }
                    if last_error.contains("does not exist") =>
                {
                    GatewayError::ResourceNotFound {
                        kind: "storage".into(),
                        id: storage.to_string(),
                    }
                }
                _ => e,
            })?;
        let mut status = with_usage(status);
        status["node"] = json!(node);
        status["storage"] = json!(storage);
        Ok(status)
    }
    .boxed()
}

fn get_storage_content<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let storage = required_str(args, "storage")?;
        let content = optional_str(args, "content");
        let volumes = ctx
            .client
            .storage_content(node, storage, content)
            .await?;
        let total_size: u64 = volumes.iter().filter_map(|v| v["size"].as_u64()).sum();
        Ok(json!({
            "node": node,
            "storage": storage,
            "content": volumes,
            "total": volumes.len(),
            "total_size": total_size,
        }))
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::dispatcher;
    use crate::mock::MockTransport;

    #[test]
    fn usage_only_when_total_known() {
        let s = with_usage(json!({"storage": "local", "used": 25, "total": 100}));
        assert_eq!(s["usage_percent"], 25.0);
        let s = with_usage(json!({"storage": "nfs"}));
        assert!(s.get("usage_percent").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_usage() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond(
            "storage_status",
            json!({"type": "lvmthin", "used": 300, "total": 1000, "active": 1}),
        );

        let env = d
            .call_operation(
                "get_storage_status",
                &json!({"node": "pve1", "storage": "local-lvm"}),
                "viewer",
            )
            .await;
        let result = env.result.unwrap();
        assert_eq!(result["usage_percent"], 30.0);
        assert_eq!(result["storage"], "local-lvm");
    }

    #[tokio::test(start_paused = true)]
    async fn content_totals_sizes() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond(
            "storage_content",
            json!([
                {"volid": "local:iso/a.iso", "size": 100},
                {"volid": "local:iso/b.iso", "size": 50}
            ]),
        );

        let env = d
            .call_operation(
                "get_storage_content",
                &json!({"node": "pve1", "storage": "local", "content": "iso"}),
                "viewer",
            )
            .await;
        let result = env.result.unwrap();
        assert_eq!(result["total"], 2);
        assert_eq!(result["total_size"], 150);
    }
}
