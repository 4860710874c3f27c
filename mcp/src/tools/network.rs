//! Node network configuration.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{config, flag, node_property, optional_str, push, push_opt, required_str, schema};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;
use crate::transport::Params;

/// Parameters for `create_bridge`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Physical ports to enslave, space separated (default none).
    #[serde(default)]
    pub bridge_ports: String,
    /// Bring up at boot (default true).
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Spanning tree (default off).
    #[serde(default)]
    pub bridge_stp: bool,
    /// Forward delay in seconds (default 0).
    #[serde(default)]
    pub bridge_fd: u32,
    #[serde(default)]
    pub bridge_vlan_aware: bool,
    /// Address in CIDR form, e.g. `10.10.0.1/24`.
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    pub comments: Option<String>,
}

fn default_true() -> bool {
    true
}

impl BridgeConfig {
    pub fn to_params(&self, iface: &str) -> Params {
        let mut params = Params::new();
        push(&mut params, "iface", iface);
        push(&mut params, "type", "bridge");
        push(&mut params, "autostart", flag(self.autostart));
        push(&mut params, "bridge_ports", &self.bridge_ports);
        push(
            &mut params,
            "bridge_stp",
            if self.bridge_stp { "on" } else { "off" },
        );
        push(&mut params, "bridge_fd", self.bridge_fd);
        if self.bridge_vlan_aware {
            push(&mut params, "bridge_vlan_aware", 1);
        }
        push_opt(&mut params, "cidr", self.cidr.as_deref());
        push_opt(&mut params, "gateway", self.gateway.as_deref());
        push_opt(&mut params, "comments", self.comments.as_deref());
        params
    }
}

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "get_network_config",
            description: "List network interfaces (bridges, bonds, physical NICs, VLANs) configured on a node.",
            permission: "network:monitor",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "type": { "type": "string", "enum": ["bridge", "bond", "eth", "vlan", "OVSBridge"], "description": "Only list interfaces of this type." }
                }),
                &["node"],
            ),
            handler: get_network_config,
        },
        OperationDescriptor {
            name: "create_bridge",
            description: "Stage a new Linux bridge on a node. The change is pending until the node's network configuration is applied.",
            permission: "network:create",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "bridge_name": { "type": "string", "pattern": "^vmbr\\d+$", "description": "Bridge interface name, e.g. \"vmbr1\"." },
                    "config": {
                        "type": "object",
                        "description": "Bridge settings: bridge_ports (\"\"), autostart (true), bridge_stp (false), bridge_fd (0), bridge_vlan_aware (false), cidr, gateway, comments."
                    }
                }),
                &["node", "bridge_name"],
            ),
            handler: create_bridge,
        },
    ]
}

/// Proxmox only accepts bridge names of the form `vmbrN`.
fn valid_bridge_name(name: &str) -> bool {
    name.strip_prefix("vmbr")
        .is_some_and(|n| !n.is_empty() && n.len() <= 4 && n.bytes().all(|b| b.is_ascii_digit()))
}

fn get_network_config<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let kind = optional_str(args, "type");
        let interfaces: Vec<Value> = ctx
            .client
            .network_config(node)
            .await?
            .into_iter()
            .filter(|i| kind.map_or(true, |k| i["type"].as_str() == Some(k)))
            .collect();
        Ok(json!({
            "node": node,
            "interfaces": interfaces,
            "total": interfaces.len(),
        }))
    }
    .boxed()
}

fn create_bridge<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let bridge = required_str(args, "bridge_name")?;
        if !valid_bridge_name(bridge) {
            return Err(GatewayError::validation(
                "bridge_name",
                "must look like vmbr<N>",
            ));
        }
        let cfg: BridgeConfig = config(args, "config")?;

        ctx.client
            .create_network_interface(node, cfg.to_params(bridge))
            .await?;

        Ok(json!({
            "node": node,
            "bridge": bridge,
            "action": "create",
            "status": "pending",
            "message": format!("Bridge {bridge} staged on {node}; apply the network configuration to activate it"),
        }))
    }
    .boxed()
}
