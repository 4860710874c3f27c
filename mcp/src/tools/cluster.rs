//! Cluster-wide status and resources.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::{optional_str, schema};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "get_cluster_status",
            description: "Get cluster name, quorum state and per-node membership. Standalone nodes report a single entry.",
            permission: "cluster:monitor",
            input_schema: schema(json!({}), &[]),
            handler: get_cluster_status,
        },
        OperationDescriptor {
            name: "get_cluster_resources",
            description: "List every VM, container, storage and node in the cluster with live usage figures.",
            permission: "cluster:monitor",
            input_schema: schema(
                json!({
                    "type": { "type": "string", "enum": ["vm", "storage", "node", "sdn"], "description": "Only list resources of this type." }
                }),
                &[],
            ),
            handler: get_cluster_resources,
        },
        OperationDescriptor {
            name: "get_ha_resources",
            description: "List resources managed by the high-availability stack and their requested state.",
            permission: "cluster:monitor",
            input_schema: schema(json!({}), &[]),
            handler: get_ha_resources,
        },
    ]
}

/// Shape `/cluster/status` entries into `{cluster, nodes, status}`.
///
/// The `cluster` entry is absent on standalone nodes; those are reported as
/// quorate.
pub(crate) fn parse_cluster_status(entries: &[Value]) -> Value {
    let cluster = entries.iter().find(|e| e["type"] == "cluster");
    let nodes: Vec<Value> = entries
        .iter()
        .filter(|e| e["type"] == "node")
        .map(|n| {
            json!({
                "name": n["name"],
                "id": n["nodeid"],
                "online": n["online"].as_u64() == Some(1),
                "local": n["local"].as_u64() == Some(1),
                "ip": n["ip"],
            })
        })
        .collect();
    let online = nodes.iter().filter(|n| n["online"] == true).count();
    let quorate = cluster.map_or(true, |c| c["quorate"].as_u64() == Some(1));

    json!({
        "cluster": cluster.map(|c| json!({
            "name": c["name"],
            "version": c["version"],
            "quorate": quorate,
            "nodes": c["nodes"],
        })),
        "nodes": nodes,
        "online_nodes": online,
        "total_nodes": nodes.len(),
        "status": if quorate { "healthy" } else { "degraded" },
    })
}

/// Group `/cluster/resources` entries by their `type`.
pub(crate) fn group_by_type(resources: Vec<Value>) -> BTreeMap<String, Vec<Value>> {
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for r in resources {
        let kind = r["type"].as_str().unwrap_or("unknown").to_string();
        grouped.entry(kind).or_default().push(r);
    }
    grouped
}

fn get_cluster_status<'a>(
    ctx: &'a GatewayContext,
    _args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let entries = ctx.client.cluster_status().await?;
        Ok(parse_cluster_status(&entries))
    }
    .boxed()
}

fn get_cluster_resources<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let resources = ctx
            .client
            .cluster_resources(optional_str(args, "type"))
            .await?;
        let counts: BTreeMap<String, usize> = group_by_type(resources.clone())
            .into_iter()
            .map(|(k, v)| (k, v.len()))
            .collect();
        Ok(json!({
            "resources": resources,
            "total": resources.len(),
            "by_type": counts,
        }))
    }
    .boxed()
}

fn get_ha_resources<'a>(
    ctx: &'a GatewayContext,
    _args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let resources = ctx.client.ha_resources().await?;
        Ok(json!({
            "resources": resources,
            "total": resources.len(),
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
    fn quorate_cluster_is_healthy() {
        let parsed = parse_cluster_status(&[
            json!({"type": "cluster", "name": "lab", "quorate": 1, "nodes": 2, "version": 4}),
            json!({"type": "node", "name": "pve1", "online": 1, "local": 1, "ip": "10.0.0.1"}),
            json!({"type": "node", "name": "pve2", "online": 0, "local": 0, "ip": "10.0.0.2"}),
        ]);
        assert_eq!(parsed["status"], "healthy");
        assert_eq!(parsed["cluster"]["name"], "lab");
        assert_eq!(parsed["online_nodes"], 1);
        assert_eq!(parsed["total_nodes"], 2);
        assert_eq!(parsed["nodes"][0]["local"], true);
    }

    #[test]
    fn lost_quorum_is_degraded() {
        let parsed = parse_cluster_status(&[json!({"type": "cluster", "name": "lab", "quorate": 0})]);
        assert_eq!(parsed["status"], "degraded");
    }

    #[test]
    fn standalone_node_has_no_cluster_entry() {
        let parsed = parse_cluster_status(&[json!({"type": "node", "name": "pve1", "online": 1})]);
        assert!(parsed["cluster"].is_null());
        assert_eq!(parsed["status"], "healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn resources_are_counted_by_type() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond(
            "cluster_resources",
            json!([
                {"type": "qemu", "vmid": 101},
                {"type": "qemu", "vmid": 102},
                {"type": "storage", "storage": "local"}
            ]),
        );

        let env = d
            .call_operation("get_cluster_resources", &json!({}), "viewer")
            .await;
        let result = env.result.unwrap();
        assert_eq!(result["total"], 3);
        assert_eq!(result["by_type"]["qemu"], 2);
        assert_eq!(result["by_type"]["storage"], 1);
    }
}
