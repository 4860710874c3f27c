//! Operation definitions and handlers.
//!
//! Each submodule contributes [`OperationDescriptor`]s for one resource area
//! and collects them in its `operations()`:
//!
//! - [`vm`]: `list_vms`, `get_vm_details`, `create_vm`, `start_vm`, `stop_vm`,
//!   `delete_vm`, `clone_vm`, `migrate_vm`
//! - [`lxc`]: `list_containers`, `get_container_details`, `create_container`,
//!   `start_container`, `stop_container`, `delete_container`, `clone_container`
//! - [`cluster`]: `get_cluster_status`, `get_cluster_resources`, `get_ha_resources`
//! - [`storage`]: `list_storages`, `get_storage_status`, `get_storage_content`
//! - [`network`]: `get_network_config`, `create_bridge`
//! - [`node`]: `list_nodes`, `get_node_status`, `get_node_services`
//! - [`backup`]: `create_backup`, `list_backups`, `restore_backup`
//! - [`analysis`]: `analyze_vm_performance`
//!
//! Handlers receive arguments that already passed schema validation; the
//! helpers below still return `ValidationError` for values the schema cannot
//! express (id ranges, nested config records).

pub mod analysis;
pub mod backup;
pub mod cluster;
pub mod guests;
pub mod lxc;
pub mod network;
pub mod node;
pub mod storage;
pub mod vm;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::dispatcher::OperationDescriptor;
use crate::error::GatewayError;
use crate::transport::Params;

/// Smallest guest id Proxmox accepts.
pub const MIN_VMID: u64 = 100;
/// Largest guest id Proxmox accepts.
pub const MAX_VMID: u64 = 999_999_999;

/// Every built-in operation, in listing order.
pub fn all_operations() -> Vec<OperationDescriptor> {
    let mut ops = vm::operations();
    ops.extend(lxc::operations());
    ops.extend(cluster::operations());
    ops.extend(storage::operations());
    ops.extend(network::operations());
    ops.extend(node::operations());
    ops.extend(backup::operations());
    ops.extend(analysis::operations());
    ops
}

/// Object schema with the given properties and required fields.
pub(crate) fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

pub(crate) fn node_property() -> Value {
    json!({ "type": "string", "description": "Cluster node name, e.g. \"pve1\"." })
}

pub(crate) fn vmid_property(description: &str) -> Value {
    json!({ "type": "integer", "minimum": MIN_VMID, "maximum": MAX_VMID, "description": description })
}

pub(crate) fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, GatewayError> {
    match args.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(GatewayError::validation(field, "must not be empty")),
        None => Err(GatewayError::validation(field, "missing required field")),
    }
}

pub(crate) fn optional_str<'a>(args: &'a Value, field: &str) -> Option<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

pub(crate) fn optional_bool(args: &Value, field: &str, default: bool) -> bool {
    args.get(field).and_then(Value::as_bool).unwrap_or(default)
}

/// Guest id in the range Proxmox accepts.
pub(crate) fn vmid(args: &Value, field: &str) -> Result<u32, GatewayError> {
    let raw = args
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| GatewayError::validation(field, "must be a positive integer"))?;
    if !(MIN_VMID..=MAX_VMID).contains(&raw) {
        return Err(GatewayError::validation(
            field,
            format!("must be between {MIN_VMID} and {MAX_VMID}"),
        ));
    }
    u32::try_from(raw).map_err(|_| GatewayError::validation(field, "out of range"))
}

/// Deserialize the `field` object into a config record; absent means defaults.
pub(crate) fn config<T: DeserializeOwned>(args: &Value, field: &str) -> Result<T, GatewayError> {
    let raw = match args.get(field) {
        None | Some(Value::Null) => json!({}),
        Some(v) => v.clone(),
    };
    serde_json::from_value(raw).map_err(|e| GatewayError::validation(field, e.to_string()))
}

/// Push `key=value` when `value` is set.
pub(crate) fn push_opt(params: &mut Params, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        params.push((key.to_string(), v.to_string()));
    }
}

pub(crate) fn push(params: &mut Params, key: &str, value: impl ToString) {
    params.push((key.to_string(), value.to_string()));
}

/// Proxmox boolean flag encoding.
pub(crate) fn flag(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

/// `used / total * 100`, rounded to two decimals; 0 when total is unknown.
pub(crate) fn percent(used: &Value, total: &Value) -> f64 {
    let used = used.as_f64().unwrap_or(0.0);
    let total = total.as_f64().unwrap_or(0.0);
    if total <= 0.0 {
        0.0
    } else {
        round2(used / total * 100.0)
    }
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn vmid_range_is_enforced() {
        assert_eq!(vmid(&json!({"vmid": 101}), "vmid").unwrap(), 101);
        let err = vmid(&json!({"vmid": 99}), "vmid").unwrap_err();
        assert_eq!(err.details()["field"], "vmid");
        assert!(vmid(&json!({"vmid": -5}), "vmid").is_err());
        assert!(vmid(&json!({"vmid": 1_000_000_000u64}), "vmid").is_err());
    }

    #[test]
    fn empty_strings_are_rejected() {
        let err = required_str(&json!({"node": "  "}), "node").unwrap_err();
        assert_eq!(err.code(), "ValidationError");
        assert!(optional_str(&json!({"node": ""}), "node").is_none());
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        #[serde(default)]
        cores: Option<u32>,
    }

    #[test]
    fn config_errors_name_the_field() {
        let sample: Sample = config(&json!({}), "config").unwrap();
        assert!(sample.cores.is_none());

        let err = config::<Sample>(&json!({"config": {"cores": "four"}}), "config").unwrap_err();
        assert_eq!(err.details()["field"], "config");
    }

    #[test]
    fn percent_handles_missing_totals() {
        assert_eq!(percent(&json!(50), &json!(200)), 25.0);
        assert_eq!(percent(&json!(50), &Value::Null), 0.0);
        assert_eq!(percent(&json!(1), &json!(3)), 33.33);
    }
}
