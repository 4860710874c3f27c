//! QEMU virtual machine operations.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::guests::{self, lifecycle_hook};
use super::{config, flag, node_property, push, required_str, schema, vmid, vmid_property};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;
use crate::transport::{GuestKind, Params};

const KIND: GuestKind = GuestKind::Qemu;

/// Parameters for `migrate_vm`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrateConfig {
    /// Live migration of a running VM (default true).
    #[serde(default = "default_true")]
    pub online: bool,
    /// Also migrate local disks (default false).
    #[serde(default)]
    pub with_local_disks: bool,
    /// Map local disks to this storage on the target.
    pub target_storage: Option<String>,
}

fn default_true() -> bool {
    true
}

impl MigrateConfig {
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        push(&mut params, "online", flag(self.online));
        push(&mut params, "with-local-disks", flag(self.with_local_disks));
        if let Some(storage) = &self.target_storage {
            push(&mut params, "targetstorage", storage);
        }
        params
    }
}

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "list_vms",
            description: "List QEMU virtual machines with status, CPU and memory usage. Lists every node unless `node` is given.",
            permission: "vm:monitor",
            input_schema: schema(
                json!({
                    "node": { "type": "string", "description": "Only list VMs on this node." },
                    "status": { "type": "string", "enum": ["running", "stopped", "paused"], "description": "Only list VMs in this state." }
                }),
                &[],
            ),
            handler: list_vms,
        },
        OperationDescriptor {
            name: "get_vm_details",
            description: "Get the current status and full configuration of one VM.",
            permission: "vm:monitor",
            input_schema: schema(
                json!({ "node": node_property(), "vmid": vmid_property("VM id.") }),
                &["node", "vmid"],
            ),
            handler: get_vm_details,
        },
        OperationDescriptor {
            name: "create_vm",
            description: "Create a VM and wait for the creation task to finish. `config.memory` (MiB) is required; cores, sockets, cpu, ostype, boot and net0 have defaults.",
            permission: "vm:create",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Id for the new VM."),
                    "config": {
                        "type": "object",
                        "description": "VM settings: name, memory (MiB, required), cores (1), sockets (1), cpu (kvm64), ostype (l26), boot (cdn), net0 (virtio,bridge=vmbr0), scsihw, scsi0, ide2, description, start (false)."
                    }
                }),
                &["node", "vmid", "config"],
            ),
            handler: create_vm,
        },
        OperationDescriptor {
            name: "start_vm",
            description: "Start a VM and wait until the start task completes.",
            permission: "vm:start",
            input_schema: schema(
                json!({ "node": node_property(), "vmid": vmid_property("VM id.") }),
                &["node", "vmid"],
            ),
            handler: start_vm,
        },
        OperationDescriptor {
            name: "stop_vm",
            description: "Stop a VM: ACPI shutdown by default, hard stop with `force`. Waits for the task.",
            permission: "vm:stop",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("VM id."),
                    "force": { "type": "boolean", "description": "Hard stop instead of a guest shutdown (default false)." }
                }),
                &["node", "vmid"],
            ),
            handler: stop_vm,
        },
        OperationDescriptor {
            name: "delete_vm",
            description: "Delete a VM and its disks. The VM must be stopped. Waits for the task.",
            permission: "vm:delete",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("VM id."),
                    "purge": { "type": "boolean", "description": "Also remove the VM from backup jobs and HA (default false)." }
                }),
                &["node", "vmid"],
            ),
            handler: delete_vm,
        },
        OperationDescriptor {
            name: "clone_vm",
            description: "Clone a VM or template to a new id and wait for the copy to finish.",
            permission: "vm:clone",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Source VM id."),
                    "newid": vmid_property("Id for the clone."),
                    "config": {
                        "type": "object",
                        "description": "Clone settings: name (clone-of-{vmid}), full (true), target (source node), storage, description."
                    }
                }),
                &["node", "vmid", "newid"],
            ),
            handler: clone_vm,
        },
        OperationDescriptor {
            name: "migrate_vm",
            description: "Start migrating a VM to another node. Returns the task id immediately; does not wait for completion.",
            permission: "vm:migrate",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("VM id."),
                    "target_node": { "type": "string", "description": "Destination node." },
                    "config": {
                        "type": "object",
                        "description": "Migration settings: online (true), with_local_disks (false), target_storage."
                    }
                }),
                &["node", "vmid", "target_node"],
            ),
            handler: migrate_vm,
        },
    ]
}

fn list_vms<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::list(ctx, args, KIND).boxed()
}

fn get_vm_details<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::details(ctx, args, KIND).boxed()
}

fn create_vm<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::create(ctx, args, KIND).boxed()
}

fn start_vm<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::start(ctx, args, KIND).boxed()
}

fn stop_vm<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::stop(ctx, args, KIND).boxed()
}

fn delete_vm<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::delete(ctx, args, KIND).boxed()
}

fn clone_vm<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    guests::clone(ctx, args, KIND).boxed()
}

fn migrate_vm<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let vmid = vmid(args, "vmid")?;
        let target = required_str(args, "target_node")?;
        if target == node {
            return Err(GatewayError::validation(
                "target_node",
                "must differ from the source node",
            ));
        }
        let cfg: MigrateConfig = config(args, "config")?;

        let handle = ctx
            .client
            .migrate_vm(node, vmid, target, cfg.to_params())
            .await?;

        let result = json!({
            "vmid": vmid,
            "node": node,
            "target_node": target,
            "online": cfg.online,
            "task_id": handle.to_string(),
            "action": "migrate",
            "status": "migrating",
        });
        ctx.webhooks.notify(lifecycle_hook(KIND), result.clone());
        Ok(result)
    }
    .boxed()
}
