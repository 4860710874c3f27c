//! LXC container operations.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::guests;
use super::{node_property, schema, vmid_property};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;
use crate::transport::GuestKind;

const KIND: GuestKind = GuestKind::Lxc;

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "list_containers",
            description: "List LXC containers with status, CPU and memory usage. Lists every node unless `node` is given.",
            permission: "lxc:monitor",
            input_schema: schema(
                json!({
                    "node": { "type": "string", "description": "Only list containers on this node." },
                    "status": { "type": "string", "enum": ["running", "stopped"], "description": "Only list containers in this state." }
                }),
                &[],
            ),
            handler: list_containers,
        },
        OperationDescriptor {
            name: "get_container_details",
            description: "Get the current status and full configuration of one container.",
            permission: "lxc:monitor",
            input_schema: schema(
                json!({ "node": node_property(), "vmid": vmid_property("Container id.") }),
                &["node", "vmid"],
            ),
            handler: get_container_details,
        },
        OperationDescriptor {
            name: "create_container",
            description: "Create a container from a template and wait for the creation task. `config.ostemplate` and `config.memory` (MiB) are required.",
            permission: "lxc:create",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Id for the new container."),
                    "config": {
                        "type": "object",
                        "description": "Container settings: ostemplate (required), memory (MiB, required), swap (= memory), cores (1), hostname (ct-{vmid}), password, storage (local), rootfs_size (GiB), net0 (name=eth0,bridge=vmbr0,ip=dhcp), ostype (unmanaged), arch (amd64), unprivileged (true), ssh_public_keys, start (false)."
                    }
                }),
                &["node", "vmid", "config"],
            ),
            handler: create_container,
        },
        OperationDescriptor {
            name: "start_container",
            description: "Start a container and wait until the start task completes.",
            permission: "lxc:start",
            input_schema: schema(
                json!({ "node": node_property(), "vmid": vmid_property("Container id.") }),
                &["node", "vmid"],
            ),
            handler: start_container,
        },
        OperationDescriptor {
            name: "stop_container",
            description: "Stop a container: clean shutdown by default, hard stop with `force`. Waits for the task.",
            permission: "lxc:stop",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Container id."),
                    "force": { "type": "boolean", "description": "Hard stop instead of a clean shutdown (default false)." }
                }),
                &["node", "vmid"],
            ),
            handler: stop_container,
        },
        OperationDescriptor {
            name: "delete_container",
            description: "Delete a stopped container and its volumes. Waits for the task.",
            permission: "lxc:delete",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Container id."),
                    "purge": { "type": "boolean", "description": "Also remove the container from backup jobs and HA (default false)." }
                }),
                &["node", "vmid"],
            ),
            handler: delete_container,
        },
        OperationDescriptor {
            name: "clone_container",
            description: "Clone a container or template to a new id and wait for the copy to finish.",
            permission: "lxc:clone",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Source container id."),
                    "newid": vmid_property("Id for the clone."),
                    "config": {
                        "type": "object",
                        "description": "Clone settings: name (hostname, default clone-of-{vmid}), full (true), target (source node), storage, description."
                    }
                }),
                &["node", "vmid", "newid"],
            ),
            handler: clone_container,
        },
    ]
}

fn list_containers<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::list(ctx, args, KIND).boxed()
}

fn get_container_details<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::details(ctx, args, KIND).boxed()
}

fn create_container<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::create(ctx, args, KIND).boxed()
}

fn start_container<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::start(ctx, args, KIND).boxed()
}

fn stop_container<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::stop(ctx, args, KIND).boxed()
}

fn delete_container<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::delete(ctx, args, KIND).boxed()
}

fn clone_container<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::clone(ctx, args, KIND).boxed()
}
