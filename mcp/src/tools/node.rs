//! Node inventory, status and services.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::{node_property, percent, required_str, round2, schema};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "list_nodes",
            description: "List cluster nodes with online state, CPU and memory usage, and uptime.",
            permission: "node:monitor",
            input_schema: schema(json!({}), &[]),
            handler: list_nodes,
        },
        OperationDescriptor {
            name: "get_node_status",
            description: "Get detailed status of one node: CPU, memory, swap, root filesystem, load average, kernel and PVE version.",
            permission: "node:monitor",
            input_schema: schema(json!({ "node": node_property() }), &["node"]),
            handler: get_node_status,
        },
        OperationDescriptor {
            name: "get_node_services",
            description: "List system services on a node (pveproxy, pvedaemon, corosync, ...) and their state.",
            permission: "node:services",
            input_schema: schema(json!({ "node": node_property() }), &["node"]),
            handler: get_node_services,
        },
    ]
}

/// Compact node entry from `/nodes`.
pub(crate) fn summarize_node(n: &Value) -> Value {
    json!({
        "node": n["node"],
        "status": n["status"],
        "cpu_usage_percent": round2(n["cpu"].as_f64().unwrap_or(0.0) * 100.0),
        "cpus": n["maxcpu"],
        "memory": {
            "used": n["mem"],
            "total": n["maxmem"],
            "usage_percent": percent(&n["mem"], &n["maxmem"]),
        },
        "uptime": n["uptime"],
    })
}

fn list_nodes<'a>(
    ctx: &'a GatewayContext,
    _args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let nodes: Vec<Value> = ctx
            .client
            .list_nodes()
            .await?
            .iter()
            .map(summarize_node)
            .collect();
        let online = nodes.iter().filter(|n| n["status"] == "online").count();
        Ok(json!({
            "nodes": nodes,
            "total": nodes.len(),
            "online": online,
        }))
    }
    .boxed()
}

fn get_node_status<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let status = ctx.client.node_status(node).await?;
        Ok(json!({
            "node": node,
            "uptime": status["uptime"],
            "cpu_usage_percent": round2(status["cpu"].as_f64().unwrap_or(0.0) * 100.0),
            "cpuinfo": status["cpuinfo"],
            "loadavg": status["loadavg"],
            "memory": {
                "used": status["memory"]["used"],
                "total": status["memory"]["total"],
                "usage_percent": percent(&status["memory"]["used"], &status["memory"]["total"]),
            },
            "swap": status["swap"],
            "rootfs": {
                "used": status["rootfs"]["used"],
                "total": status["rootfs"]["total"],
                "usage_percent": percent(&status["rootfs"]["used"], &status["rootfs"]["total"]),
            },
            "kversion": status["kversion"],
            "pveversion": status["pveversion"],
        }))
    }
    .boxed()
}

fn get_node_services<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let services = ctx.client.node_services(node).await?;
        let running = services
            .as_array()
            .map_or(0, |s| s.iter().filter(|x| x["state"] == "running").count());
        Ok(json!({
            "node": node,
            "services": services,
            "running": running,
        }))
    }
    .boxed()
}
