//! Read-only MCP resources.
//!
//! A fixed set of `proxmox://` URIs, each a JSON snapshot assembled from the
//! same client calls the tools use. Every URI is gated by a monitor
//! permission.

use serde_json::{json, Value};

use crate::dispatcher::GatewayContext;
use crate::error::GatewayError;
use crate::tools::backup::{collect_backups, summarize_backups};
use crate::tools::cluster::{group_by_type, parse_cluster_status};
use crate::tools::node::summarize_node;
use crate::tools::storage::with_usage;
use crate::transport::GuestKind;

struct ResourceDef {
    uri: &'static str,
    name: &'static str,
    description: &'static str,
    permission: &'static str,
}

const RESOURCES: &[ResourceDef] = &[
    ResourceDef {
        uri: "proxmox://cluster/status",
        name: "Cluster status",
        description: "Quorum state and node membership",
        permission: "cluster:monitor",
    },
    ResourceDef {
        uri: "proxmox://cluster/resources",
        name: "Cluster resources",
        description: "All cluster resources grouped by type",
        permission: "cluster:monitor",
    },
    ResourceDef {
        uri: "proxmox://nodes/summary",
        name: "Node summary",
        description: "Nodes with CPU and memory usage",
        permission: "node:monitor",
    },
    ResourceDef {
        uri: "proxmox://vms/list",
        name: "Virtual machines",
        description: "Every QEMU VM across all nodes",
        permission: "vm:monitor",
    },
    ResourceDef {
        uri: "proxmox://containers/list",
        name: "Containers",
        description: "Every LXC container across all nodes",
        permission: "lxc:monitor",
    },
    ResourceDef {
        uri: "proxmox://storage/summary",
        name: "Storage summary",
        description: "Storage capacity and usage totals",
        permission: "storage:monitor",
    },
    ResourceDef {
        uri: "proxmox://network/summary",
        name: "Network summary",
        description: "Network interfaces per node",
        permission: "network:monitor",
    },
    ResourceDef {
        uri: "proxmox://backups/summary",
        name: "Backup summary",
        description: "Backup counts and sizes by type, node and storage",
        permission: "backup:monitor",
    },
];

/// MCP resource descriptors: `{uri, name, description, mimeType}`.
pub fn definitions() -> Vec<Value> {
    RESOURCES
        .iter()
        .map(|r| {
            json!({
                "uri": r.uri,
                "name": r.name,
                "description": r.description,
                "mimeType": "application/json",
            })
        })
        .collect()
}

/// Permission guarding `uri`, or `None` for an unknown URI.
pub fn permission_for(uri: &str) -> Option<&'static str> {
    RESOURCES.iter().find(|r| r.uri == uri).map(|r| r.permission)
}

pub async fn read(ctx: &GatewayContext, uri: &str) -> Result<Value, GatewayError> {
    let client = &ctx.client;
    match uri {
        "proxmox://cluster/status" => {
            let entries = client.cluster_status().await?;
            Ok(parse_cluster_status(&entries))
        }
        "proxmox://cluster/resources" => {
            let resources = client.cluster_resources(None).await?;
            Ok(json!({
                "total": resources.len(),
                "resources": group_by_type(resources),
            }))
        }
        "proxmox://nodes/summary" => {
            let nodes = client.list_nodes().await?;
            let online = nodes.iter().filter(|n| n["status"] == "online").count();
            Ok(json!({
                "total": nodes.len(),
                "online": online,
                "nodes": nodes.iter().map(summarize_node).collect::<Vec<_>>(),
            }))
        }
        "proxmox://vms/list" => guest_list(ctx, GuestKind::Qemu, "vms").await,
        "proxmox://containers/list" => guest_list(ctx, GuestKind::Lxc, "containers").await,
        "proxmox://storage/summary" => storage_summary(ctx).await,
        "proxmox://network/summary" => network_summary(ctx).await,
        "proxmox://backups/summary" => {
            let backups = collect_backups(ctx, None, None).await?;
            Ok(summarize_backups(&backups, chrono::Utc::now().timestamp()))
        }
        _ => Err(GatewayError::UnknownResource(uri.to_string())),
    }
}

async fn guest_list(ctx: &GatewayContext, kind: GuestKind, key: &str) -> Result<Value, GatewayError> {
    let guests = ctx.client.list_guests(kind, None).await?;
    let running = guests.iter().filter(|g| g["status"] == "running").count();
    let mut out = serde_json::Map::new();
    out.insert("total".into(), json!(guests.len()));
    out.insert("running".into(), json!(running));
    out.insert(key.into(), Value::Array(guests));
    Ok(Value::Object(out))
}

/// Per-node storage with usage, plus totals over shared storage counted once.
async fn storage_summary(ctx: &GatewayContext) -> Result<Value, GatewayError> {
    let nodes = online_nodes(ctx).await?;
    let mut seen_shared = std::collections::HashSet::new();
    let mut entries = Vec::new();
    let (mut used, mut total) = (0u64, 0u64);

    for node in &nodes {
        let storages = match ctx.client.list_storage(Some(node)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "Skipping node in storage summary");
                continue;
            }
        };
        for mut s in storages.into_iter().map(with_usage) {
            let name = s["storage"].as_str().unwrap_or_default().to_string();
            let shared = s["shared"].as_u64() == Some(1);
            if !shared || seen_shared.insert(name) {
                used += s["used"].as_u64().unwrap_or(0);
                total += s["total"].as_u64().unwrap_or(0);
            }
            s["node"] = json!(node);
            entries.push(s);
        }
    }

    Ok(json!({
        "storages": entries,
        "total_used": used,
        "total_capacity": total,
        "usage_percent": crate::tools::percent(&json!(used), &json!(total)),
    }))
}

async fn network_summary(ctx: &GatewayContext) -> Result<Value, GatewayError> {
    let mut per_node = serde_json::Map::new();
    for node in online_nodes(ctx).await? {
        match ctx.client.network_config(&node).await {
            Ok(ifaces) => {
                per_node.insert(node, Value::Array(ifaces));
            }
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "Skipping node in network summary");
            }
        }
    }
    Ok(json!({ "nodes": per_node }))
}

async fn online_nodes(ctx: &GatewayContext) -> Result<Vec<String>, GatewayError> {
    Ok(ctx
        .client
        .list_nodes()
        .await?
        .iter()
        .filter(|n| n["status"] != "offline")
        .filter_map(|n| n["node"].as_str().map(String::from))
        .collect())
}
