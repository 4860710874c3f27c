//! Handlers shared by VMs and containers.
//!
//! QEMU VMs and LXC containers have the same lifecycle API under a different
//! path segment, so the `vm` and `lxc` modules register thin wrappers around
//! the functions here, passing their [`GuestKind`].

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    config, flag, optional_bool, optional_str, percent, push, push_opt, required_str, vmid,
};
use crate::dispatcher::GatewayContext;
use crate::error::GatewayError;
use crate::transport::{GuestKind, Params};

/// Parameters for `create_vm`. `memory` is required; everything else has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateVmConfig {
    pub name: Option<String>,
    /// MiB.
    pub memory: u64,
    #[serde(default = "default_one")]
    pub cores: u32,
    #[serde(default = "default_one")]
    pub sockets: u32,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_vm_ostype")]
    pub ostype: String,
    #[serde(default = "default_boot")]
    pub boot: String,
    #[serde(default = "default_vm_net")]
    pub net0: String,
    pub scsihw: Option<String>,
    /// Disk spec, e.g. `local-lvm:32`.
    pub scsi0: Option<String>,
    /// CD-ROM spec, e.g. `local:iso/debian-12.iso,media=cdrom`.
    pub ide2: Option<String>,
    pub description: Option<String>,
    /// Start the VM once created.
    #[serde(default)]
    pub start: bool,
}

/// Parameters for `create_container`. `ostemplate` and `memory` are required.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateContainerConfig {
    /// Template volume, e.g. `local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst`.
    pub ostemplate: String,
    /// MiB.
    pub memory: u64,
    /// MiB. Defaults to `memory`.
    pub swap: Option<u64>,
    #[serde(default = "default_one")]
    pub cores: u32,
    /// Defaults to `ct-{vmid}`.
    pub hostname: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Root disk size in GiB on `storage`.
    pub rootfs_size: Option<u32>,
    #[serde(default = "default_ct_net")]
    pub net0: String,
    #[serde(default = "default_ct_ostype")]
    pub ostype: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_true")]
    pub unprivileged: bool,
    pub ssh_public_keys: Option<String>,
    #[serde(default)]
    pub start: bool,
}

/// Parameters for `clone_vm` / `clone_container`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneConfig {
    /// Defaults to `clone-of-{vmid}`.
    pub name: Option<String>,
    /// Full copy instead of a linked clone (default true).
    #[serde(default = "default_true")]
    pub full: bool,
    /// Target node; defaults to the source node.
    pub target: Option<String>,
    pub storage: Option<String>,
    pub description: Option<String>,
}

fn default_one() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_cpu() -> String {
    "kvm64".to_string()
}
fn default_vm_ostype() -> String {
    "l26".to_string()
}
fn default_boot() -> String {
    "cdn".to_string()
}
fn default_vm_net() -> String {
    "virtio,bridge=vmbr0".to_string()
}
fn default_storage() -> String {
    "local".to_string()
}
fn default_ct_net() -> String {
    "name=eth0,bridge=vmbr0,ip=dhcp".to_string()
}
fn default_ct_ostype() -> String {
    "unmanaged".to_string()
}
fn default_arch() -> String {
    "amd64".to_string()
}

impl CreateVmConfig {
    pub fn to_params(&self) -> Result<Params, GatewayError> {
        if self.memory == 0 {
            return Err(GatewayError::validation("config.memory", "must be positive"));
        }
        if self.cores == 0 || self.sockets == 0 {
            return Err(GatewayError::validation(
                "config.cores",
                "cores and sockets must be positive",
            ));
        }
        let mut params = Params::new();
        push_opt(&mut params, "name", self.name.as_deref());
        push(&mut params, "memory", self.memory);
        push(&mut params, "cores", self.cores);
        push(&mut params, "sockets", self.sockets);
        push(&mut params, "cpu", &self.cpu);
        push(&mut params, "ostype", &self.ostype);
        push(&mut params, "boot", &self.boot);
        push(&mut params, "net0", &self.net0);
        push_opt(&mut params, "scsihw", self.scsihw.as_deref());
        push_opt(&mut params, "scsi0", self.scsi0.as_deref());
        push_opt(&mut params, "ide2", self.ide2.as_deref());
        push_opt(&mut params, "description", self.description.as_deref());
        if self.start {
            push(&mut params, "start", 1);
        }
        Ok(params)
    }
}

impl CreateContainerConfig {
    pub fn to_params(&self, vmid: u32) -> Result<Params, GatewayError> {
        if self.ostemplate.trim().is_empty() {
            return Err(GatewayError::validation("config.ostemplate", "must not be empty"));
        }
        if self.memory == 0 {
            return Err(GatewayError::validation("config.memory", "must be positive"));
        }
        let hostname = self
            .hostname
            .clone()
            .unwrap_or_else(|| format!("ct-{vmid}"));

        let mut params = Params::new();
        push(&mut params, "ostemplate", &self.ostemplate);
        push(&mut params, "memory", self.memory);
        push(&mut params, "swap", self.swap.unwrap_or(self.memory));
        push(&mut params, "cores", self.cores);
        push(&mut params, "hostname", hostname);
        push_opt(&mut params, "password", self.password.as_deref());
        match self.rootfs_size {
            Some(size) => push(&mut params, "rootfs", format!("{}:{size}", self.storage)),
            None => push(&mut params, "storage", &self.storage),
        }
        push(&mut params, "net0", &self.net0);
        push(&mut params, "ostype", &self.ostype);
        push(&mut params, "arch", &self.arch);
        push(&mut params, "unprivileged", flag(self.unprivileged));
        push_opt(&mut params, "ssh-public-keys", self.ssh_public_keys.as_deref());
        if self.start {
            push(&mut params, "start", 1);
        }
        Ok(params)
    }
}

impl CloneConfig {
    /// The clone's name: `name` for VMs, `hostname` for containers.
    pub fn name_or_default(&self, vmid: u32) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("clone-of-{vmid}"))
    }

    pub fn to_params(&self, kind: GuestKind, vmid: u32, node: &str) -> Params {
        let name_key = match kind {
            GuestKind::Qemu => "name",
            GuestKind::Lxc => "hostname",
        };
        let mut params = Params::new();
        push(&mut params, name_key, self.name_or_default(vmid));
        push(&mut params, "full", flag(self.full));
        push(&mut params, "target", self.target.as_deref().unwrap_or(node));
        push_opt(&mut params, "storage", self.storage.as_deref());
        push_opt(&mut params, "description", self.description.as_deref());
        params
    }
}

/// Webhook workflow for lifecycle events of this guest kind.
pub(crate) fn lifecycle_hook(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Qemu => "vm-lifecycle",
        GuestKind::Lxc => "container-lifecycle",
    }
}

fn list_key(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Qemu => "vms",
        GuestKind::Lxc => "containers",
    }
}

fn op_name(kind: GuestKind, verb: &str) -> String {
    match kind {
        GuestKind::Qemu => format!("{verb}_vm"),
        GuestKind::Lxc => format!("{verb}_container"),
    }
}

/// Compact listing entry.
fn summarize(guest: &Value) -> Value {
    json!({
        "vmid": guest["vmid"],
        "name": guest["name"],
        "status": guest["status"],
        "node": guest["node"],
        "cpus": guest["cpus"],
        "cpu_usage_percent": super::round2(guest["cpu"].as_f64().unwrap_or(0.0) * 100.0),
        "memory": {
            "used": guest["mem"],
            "total": guest["maxmem"],
            "usage_percent": percent(&guest["mem"], &guest["maxmem"]),
        },
        "uptime": guest["uptime"],
        "template": guest.get("template").map_or(false, |t| t.as_u64() == Some(1)),
    })
}

pub(crate) async fn list(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = optional_str(args, "node");
    let status = optional_str(args, "status");

    let guests: Vec<Value> = ctx
        .client
        .list_guests(kind, node)
        .await?
        .iter()
        .filter(|g| status.map_or(true, |s| g["status"].as_str() == Some(s)))
        .map(summarize)
        .collect();

    let mut result = serde_json::Map::new();
    result.insert("total".into(), json!(guests.len()));
    result.insert(list_key(kind).into(), Value::Array(guests));
    Ok(Value::Object(result))
}

pub(crate) async fn details(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = required_str(args, "node")?;
    let vmid = vmid(args, "vmid")?;

    let status = ctx
        .client
        .guest_status(node, kind, vmid)
        .await
        .map_err(|e| not_found(e, kind, vmid))?;
    let config = ctx.client.guest_config(node, kind, vmid).await?;

    Ok(json!({
        "vmid": vmid,
        "node": node,
        "type": kind.as_str(),
        "name": status["name"],
        "status": status["status"],
        "uptime": status["uptime"],
        "cpu_usage_percent": super::round2(status["cpu"].as_f64().unwrap_or(0.0) * 100.0),
        "memory": {
            "used": status["mem"],
            "total": status["maxmem"],
            "usage_percent": percent(&status["mem"], &status["maxmem"]),
        },
        "config": config,
    }))
}

/// Report a missing guest as `ResourceNotFound` instead of a retry failure.
pub(crate) fn not_found(err: GatewayError, kind: GuestKind, vmid: u32) -> GatewayError {
    match &err {
        GatewayError::OperationFailed { last_error, .. }
            if last_error.contains("does not exist") || last_error.contains("HTTP 404") =>
        {
            GatewayError::ResourceNotFound {
                kind: kind.as_str().to_string(),
                id: vmid.to_string(),
            }
        }
        _ => err,
    }
}

pub(crate) async fn create(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = required_str(args, "node")?;
    let vmid = vmid(args, "vmid")?;
    let (params, name) = match kind {
        GuestKind::Qemu => {
            let cfg: CreateVmConfig = config(args, "config")?;
            (cfg.to_params()?, cfg.name.clone())
        }
        GuestKind::Lxc => {
            let cfg: CreateContainerConfig = config(args, "config")?;
            let name = cfg.hostname.clone().unwrap_or_else(|| format!("ct-{vmid}"));
            (cfg.to_params(vmid)?, Some(name))
        }
    };

    let operation = op_name(kind, "create");
    let handle = ctx.client.create_guest(node, kind, vmid, params).await?;
    let task_id = handle.to_string();
    ctx.wait(node, handle, &operation).await?;

    let result = json!({
        "vmid": vmid,
        "node": node,
        "name": name,
        "task_id": task_id,
        "action": "create",
        "status": "created",
    });
    ctx.webhooks.notify(lifecycle_hook(kind), result.clone());
    Ok(result)
}

pub(crate) async fn start(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = required_str(args, "node")?;
    let vmid = vmid(args, "vmid")?;

    let handle = ctx.client.start_guest(node, kind, vmid).await?;
    let task_id = handle.to_string();
    ctx.wait(node, handle, &op_name(kind, "start")).await?;

    let result = json!({
        "vmid": vmid,
        "node": node,
        "task_id": task_id,
        "action": "start",
        "status": "started",
    });
    ctx.webhooks.notify(lifecycle_hook(kind), result.clone());
    Ok(result)
}

pub(crate) async fn stop(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = required_str(args, "node")?;
    let vmid = vmid(args, "vmid")?;
    let force = optional_bool(args, "force", false);

    let handle = ctx.client.stop_guest(node, kind, vmid, force).await?;
    let task_id = handle.to_string();
    ctx.wait(node, handle, &op_name(kind, "stop")).await?;

    let result = json!({
        "vmid": vmid,
        "node": node,
        "task_id": task_id,
        "action": if force { "stop" } else { "shutdown" },
        "status": "stopped",
    });
    ctx.webhooks.notify(lifecycle_hook(kind), result.clone());
    Ok(result)
}

pub(crate) async fn delete(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = required_str(args, "node")?;
    let vmid = vmid(args, "vmid")?;
    let purge = optional_bool(args, "purge", false);

    let handle = ctx.client.delete_guest(node, kind, vmid, purge).await?;
    let task_id = handle.to_string();
    ctx.wait(node, handle, &op_name(kind, "delete")).await?;

    let result = json!({
        "vmid": vmid,
        "node": node,
        "task_id": task_id,
        "action": "delete",
        "purged": purge,
        "status": "deleted",
    });
    ctx.webhooks.notify(lifecycle_hook(kind), result.clone());
    Ok(result)
}

pub(crate) async fn clone(
    ctx: &GatewayContext,
    args: &Value,
    kind: GuestKind,
) -> Result<Value, GatewayError> {
    let node = required_str(args, "node")?;
    let vmid = vmid(args, "vmid")?;
    let newid = super::vmid(args, "newid")?;
    if newid == vmid {
        return Err(GatewayError::validation("newid", "must differ from vmid"));
    }
    let cfg: CloneConfig = config(args, "config")?;
    let params = cfg.to_params(kind, vmid, node);

    let handle = ctx
        .client
        .clone_guest(node, kind, vmid, newid, params)
        .await?;
    let task_id = handle.to_string();
    ctx.wait(node, handle, &op_name(kind, "clone")).await?;

    let result = json!({
        "vmid": vmid,
        "newid": newid,
        "node": node,
        "target": cfg.target.as_deref().unwrap_or(node),
        "name": cfg.name_or_default(vmid),
        "full": cfg.full,
        "task_id": task_id,
        "action": "clone",
        "status": "cloned",
    });
    ctx.webhooks.notify(lifecycle_hook(kind), result.clone());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn vm_config_defaults() {
        let cfg: CreateVmConfig = serde_json::from_value(json!({"memory": 2048})).unwrap();
        let params = cfg.to_params().unwrap();
        assert_eq!(param(&params, "memory"), Some("2048"));
        assert_eq!(param(&params, "cores"), Some("1"));
        assert_eq!(param(&params, "sockets"), Some("1"));
        assert_eq!(param(&params, "cpu"), Some("kvm64"));
        assert_eq!(param(&params, "ostype"), Some("l26"));
        assert_eq!(param(&params, "net0"), Some("virtio,bridge=vmbr0"));
        assert_eq!(param(&params, "name"), None);
        assert_eq!(param(&params, "start"), None);
    }

    #[test]
    fn vm_config_requires_memory_and_rejects_unknown_keys() {
        assert!(serde_json::from_value::<CreateVmConfig>(json!({"cores": 2})).is_err());
        assert!(
            serde_json::from_value::<CreateVmConfig>(json!({"memory": 512, "ram": 1})).is_err()
        );
        let zero: CreateVmConfig = serde_json::from_value(json!({"memory": 0})).unwrap();
        assert!(zero.to_params().is_err());
    }

    #[test]
    fn container_config_defaults() {
        let cfg: CreateContainerConfig = serde_json::from_value(json!({
            "ostemplate": "local:vztmpl/debian-12.tar.zst",
            "memory": 512
        }))
        .unwrap();
        let params = cfg.to_params(200).unwrap();
        assert_eq!(param(&params, "hostname"), Some("ct-200"));
        assert_eq!(param(&params, "swap"), Some("512"));
        assert_eq!(param(&params, "storage"), Some("local"));
        assert_eq!(param(&params, "net0"), Some("name=eth0,bridge=vmbr0,ip=dhcp"));
        assert_eq!(param(&params, "ostype"), Some("unmanaged"));
        assert_eq!(param(&params, "arch"), Some("amd64"));
        assert_eq!(param(&params, "unprivileged"), Some("1"));
    }

    #[test]
    fn container_rootfs_size_uses_storage() {
        let cfg: CreateContainerConfig = serde_json::from_value(json!({
            "ostemplate": "local:vztmpl/alpine.tar.xz",
            "memory": 256,
            "storage": "local-lvm",
            "rootfs_size": 8
        }))
        .unwrap();
        let params = cfg.to_params(201).unwrap();
        assert_eq!(param(&params, "rootfs"), Some("local-lvm:8"));
        assert_eq!(param(&params, "storage"), None);
    }

    #[test]
    fn clone_defaults_per_kind() {
        let cfg: CloneConfig = serde_json::from_value(json!({})).unwrap();
        let vm = cfg.to_params(GuestKind::Qemu, 101, "pve1");
        assert_eq!(param(&vm, "name"), Some("clone-of-101"));
        assert_eq!(param(&vm, "full"), Some("1"));
        assert_eq!(param(&vm, "target"), Some("pve1"));

        let ct = cfg.to_params(GuestKind::Lxc, 200, "pve2");
        assert_eq!(param(&ct, "hostname"), Some("clone-of-200"));
        assert_eq!(param(&ct, "name"), None);
    }
}
