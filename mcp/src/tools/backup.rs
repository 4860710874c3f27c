//! vzdump backups and restores.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{config, flag, node_property, optional_str, push, required_str, schema, vmid, vmid_property};
use crate::dispatcher::{GatewayContext, OperationDescriptor};
use crate::error::GatewayError;
use crate::transport::{GuestKind, Params};

const BACKUP_HOOK: &str = "backup-event";
/// Backups newer than this count as recent in summaries.
const RECENT_WINDOW_SECS: i64 = 7 * 24 * 3600;
const RECENT_LIMIT: usize = 10;

/// Parameters for `create_backup`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[serde(default = "default_storage")]
    pub storage: String,
    /// `snapshot`, `suspend` or `stop`.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// `0`, `gzip`, `lzo` or `zstd`.
    #[serde(default = "default_compress")]
    pub compress: String,
    /// `always` or `failure`.
    #[serde(default = "default_mail")]
    pub mailnotification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            mode: default_mode(),
            compress: default_compress(),
            mailnotification: default_mail(),
            notes: None,
            protected: None,
        }
    }
}

fn default_storage() -> String {
    "local".into()
}
fn default_mode() -> String {
    "snapshot".into()
}
fn default_compress() -> String {
    "lzo".into()
}
fn default_mail() -> String {
    "failure".into()
}

impl BackupConfig {
    pub fn to_params(&self, vmid: u32) -> Result<Params, GatewayError> {
        if !matches!(self.mode.as_str(), "snapshot" | "suspend" | "stop") {
            return Err(GatewayError::validation(
                "config.mode",
                "must be snapshot, suspend or stop",
            ));
        }
        if !matches!(self.compress.as_str(), "0" | "gzip" | "lzo" | "zstd") {
            return Err(GatewayError::validation(
                "config.compress",
                "must be 0, gzip, lzo or zstd",
            ));
        }
        let mut params = Params::new();
        push(&mut params, "vmid", vmid);
        push(&mut params, "storage", &self.storage);
        push(&mut params, "mode", &self.mode);
        push(&mut params, "compress", &self.compress);
        push(&mut params, "mailnotification", &self.mailnotification);
        if let Some(notes) = &self.notes {
            push(&mut params, "notes-template", notes);
        }
        if let Some(protected) = self.protected {
            push(&mut params, "protected", flag(protected));
        }
        Ok(params)
    }
}

/// Parameters for `restore_backup`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreConfig {
    /// Target storage for restored disks (default `local`).
    #[serde(default)]
    pub storage: Option<String>,
    /// Overwrite an existing guest with the same id.
    #[serde(default)]
    pub force: bool,
    /// Regenerate unique properties such as MAC addresses (VMs only).
    #[serde(default)]
    pub unique: Option<bool>,
}

impl RestoreConfig {
    pub fn to_params(&self, kind: GuestKind, archive: &str) -> Params {
        let mut params = Params::new();
        match kind {
            GuestKind::Qemu => push(&mut params, "archive", archive),
            GuestKind::Lxc => {
                push(&mut params, "ostemplate", archive);
                push(&mut params, "restore", 1);
            }
        }
        push(
            &mut params,
            "storage",
            self.storage.as_deref().unwrap_or("local"),
        );
        push(&mut params, "force", flag(self.force));
        if let (GuestKind::Qemu, Some(unique)) = (kind, self.unique) {
            push(&mut params, "unique", flag(unique));
        }
        params
    }
}

/// Guest type an archive restores into, from its vzdump file name.
pub(crate) fn archive_kind(archive: &str) -> GuestKind {
    if archive.to_ascii_lowercase().contains("lxc") {
        GuestKind::Lxc
    } else {
        GuestKind::Qemu
    }
}

/// Parse one storage content entry into a backup record.
///
/// Only `backup` volumes named `vzdump-{type}-{vmid}-...` qualify.
pub(crate) fn parse_backup(item: &Value, node: &str, storage: &str) -> Option<Value> {
    if item["content"].as_str() != Some("backup") {
        return None;
    }
    let volid = item["volid"].as_str().filter(|v| !v.is_empty())?;
    let filename = volid.rsplit('/').next().unwrap_or(volid);
    let mut parts = filename.split('-');
    if parts.next() != Some("vzdump") {
        return None;
    }
    let kind = parts.next()?;
    let vmid = parts.next()?.parse::<u64>().ok();

    Some(json!({
        "volid": volid,
        "filename": filename,
        "vmid": vmid,
        "type": kind,
        "node": node,
        "storage": storage,
        "size": item["size"].as_u64().unwrap_or(0),
        "ctime": item["ctime"].as_i64().unwrap_or(0),
        "format": item["format"].as_str().unwrap_or_default(),
        "notes": item["notes"].as_str().unwrap_or_default(),
        "protected": item["protected"].as_u64() == Some(1),
    }))
}

/// Counts and sizes over a backup list sorted newest first.
pub(crate) fn summarize_backups(backups: &[Value], now: i64) -> Value {
    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_node: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_storage: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_size: u64 = 0;

    for b in backups {
        let key = |field: &str| b[field].as_str().unwrap_or("unknown").to_string();
        *by_type.entry(key("type")).or_default() += 1;
        *by_node.entry(key("node")).or_default() += 1;
        *by_storage.entry(key("storage")).or_default() += 1;
        total_size += b["size"].as_u64().unwrap_or(0);
    }

    let recent: Vec<&Value> = backups
        .iter()
        .filter(|b| now - b["ctime"].as_i64().unwrap_or(0) <= RECENT_WINDOW_SECS)
        .take(RECENT_LIMIT)
        .collect();

    json!({
        "total": backups.len(),
        "total_size": total_size,
        "by_type": by_type,
        "by_node": by_node,
        "by_storage": by_storage,
        "recent": recent,
    })
}

/// Every backup volume visible from `node` (or all online nodes),
/// restricted to `storage` when given, newest first.
///
/// A node or storage that cannot be read is skipped with a warning.
pub(crate) async fn collect_backups(
    ctx: &GatewayContext,
    node: Option<&str>,
    storage: Option<&str>,
) -> Result<Vec<Value>, GatewayError> {
    let mut backups = Vec::new();

    if let (Some(node), Some(storage)) = (node, storage) {
        let content = ctx
            .client
            .storage_content(node, storage, Some("backup"))
            .await?;
        backups.extend(content.iter().filter_map(|i| parse_backup(i, node, storage)));
    } else {
        let nodes: Vec<String> = match node {
            Some(n) => vec![n.to_string()],
            None => ctx
                .client
                .list_nodes()
                .await?
                .iter()
                .filter(|n| n["status"] != "offline")
                .filter_map(|n| n["node"].as_str().map(String::from))
                .collect(),
        };

        for node in &nodes {
            let storages = match ctx.client.list_storage(Some(node)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "Skipping node while listing backups");
                    continue;
                }
            };
            for s in storages {
                let Some(name) = s["storage"].as_str() else {
                    continue;
                };
                let holds_backups = s["content"]
                    .as_str()
                    .is_some_and(|c| c.split(',').any(|t| t.trim() == "backup"));
                if !holds_backups || storage.is_some_and(|want| want != name) {
                    continue;
                }
                match ctx.client.storage_content(node, name, Some("backup")).await {
                    Ok(content) => {
                        backups.extend(content.iter().filter_map(|i| parse_backup(i, node, name)))
                    }
                    Err(e) => {
                        tracing::warn!(node = %node, storage = %name, error = %e, "Skipping storage while listing backups");
                    }
                }
            }
        }
    }

    backups.sort_by_key(|b| std::cmp::Reverse(b["ctime"].as_i64().unwrap_or(0)));
    Ok(backups)
}

pub fn operations() -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            name: "create_backup",
            description: "Start a vzdump backup of a VM or container. Returns the task id without waiting.",
            permission: "backup:create",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Guest to back up."),
                    "config": {
                        "type": "object",
                        "description": "Backup settings: storage (local), mode (snapshot|suspend|stop, default snapshot), compress (0|gzip|lzo|zstd, default lzo), mailnotification (failure), notes, protected."
                    }
                }),
                &["node", "vmid", "config"],
            ),
            handler: create_backup,
        },
        OperationDescriptor {
            name: "list_backups",
            description: "List vzdump backup archives, newest first, across all nodes and backup-capable storages unless narrowed.",
            permission: "backup:monitor",
            input_schema: schema(
                json!({
                    "node": { "type": "string", "description": "Only search this node." },
                    "storage": { "type": "string", "description": "Only search this storage." }
                }),
                &[],
            ),
            handler: list_backups,
        },
        OperationDescriptor {
            name: "restore_backup",
            description: "Restore a backup archive into guest `vmid`. The guest type follows the archive name unless `type` is given. Returns the task id without waiting.",
            permission: "backup:restore",
            input_schema: schema(
                json!({
                    "node": node_property(),
                    "vmid": vmid_property("Id of the restored guest."),
                    "archive": { "type": "string", "description": "Backup volume id, e.g. \"local:backup/vzdump-qemu-101-2024_05_01-02_00_00.vma.zst\"." },
                    "type": { "type": "string", "enum": ["qemu", "lxc"], "description": "Guest type; detected from the archive name when omitted." },
                    "config": {
                        "type": "object",
                        "description": "Restore settings: storage (local), force (false), unique (VMs only)."
                    }
                }),
                &["node", "vmid", "archive"],
            ),
            handler: restore_backup,
        },
    ]
}

fn create_backup<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let vmid = vmid(args, "vmid")?;
        let cfg: BackupConfig = config(args, "config")?;

        let handle = ctx.client.backup(node, cfg.to_params(vmid)?).await?;
        tracing::info!(node = %node, vmid, task = %handle, "Backup started");

        let result = json!({
            "vmid": vmid,
            "node": node,
            "task_id": handle.into_string(),
            "action": "create_backup",
            "status": "started",
            "config": cfg,
        });
        ctx.webhooks.notify(BACKUP_HOOK, result.clone());
        Ok(result)
    }
    .boxed()
}

fn list_backups<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let backups =
            collect_backups(ctx, optional_str(args, "node"), optional_str(args, "storage")).await?;
        Ok(json!({
            "total": backups.len(),
            "backups": backups,
        }))
    }
    .boxed()
}

fn restore_backup<'a>(
    ctx: &'a GatewayContext,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    async move {
        let node = required_str(args, "node")?;
        let vmid = vmid(args, "vmid")?;
        let archive = required_str(args, "archive")?;
        let kind = match optional_str(args, "type") {
            Some("lxc") => GuestKind::Lxc,
            Some("qemu") => GuestKind::Qemu,
            Some(_) => return Err(GatewayError::validation("type", "must be qemu or lxc")),
            None => archive_kind(archive),
        };
        let cfg: RestoreConfig = config(args, "config")?;

        let handle = ctx
            .client
            .restore(node, kind, vmid, cfg.to_params(kind, archive))
            .await?;
        tracing::info!(node = %node, vmid, archive = %archive, task = %handle, "Restore started");

        let result = json!({
            "vmid": vmid,
            "node": node,
            "type": kind.as_str(),
            "archive": archive,
            "task_id": handle.into_string(),
            "action": "restore_backup",
            "status": "started",
        });
        ctx.webhooks.notify(BACKUP_HOOK, result.clone());
        Ok(result)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::dispatcher;
    use crate::mock::MockTransport;
    use crate::transport::RemoteCall;

    fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn backup_defaults() {
        let params = BackupConfig::default().to_params(101).unwrap();
        assert_eq!(param(&params, "vmid"), Some("101"));
        assert_eq!(param(&params, "storage"), Some("local"));
        assert_eq!(param(&params, "mode"), Some("snapshot"));
        assert_eq!(param(&params, "compress"), Some("lzo"));
        assert_eq!(param(&params, "mailnotification"), Some("failure"));
    }

    #[test]
    fn backup_rejects_unknown_mode() {
        let cfg = BackupConfig {
            mode: "live".into(),
            ..Default::default()
        };
        let err = cfg.to_params(101).unwrap_err();
        assert_eq!(err.details()["field"], "config.mode");
    }

    #[test]
    fn archive_names_pick_guest_type() {
        assert_eq!(
            archive_kind("local:backup/vzdump-lxc-200-2024_05_01-02_00_00.tar.zst"),
            GuestKind::Lxc
        );
        assert_eq!(
            archive_kind("local:backup/vzdump-qemu-101-2024_05_01-02_00_00.vma.zst"),
            GuestKind::Qemu
        );
    }

    #[test]
    fn container_restore_uses_ostemplate() {
        let params = RestoreConfig::default().to_params(GuestKind::Lxc, "local:backup/x.tar");
        assert_eq!(param(&params, "ostemplate"), Some("local:backup/x.tar"));
        assert_eq!(param(&params, "restore"), Some("1"));
        assert_eq!(param(&params, "archive"), None);
        assert_eq!(param(&params, "force"), Some("0"));
    }

    #[test]
    fn parse_skips_foreign_volumes() {
        let ok = parse_backup(
            &json!({"volid": "local:backup/vzdump-qemu-101-2024_05_01-02_00_00.vma.zst", "content": "backup", "size": 10, "ctime": 5}),
            "pve1",
            "local",
        )
        .unwrap();
        assert_eq!(ok["vmid"], 101);
        assert_eq!(ok["type"], "qemu");
        assert_eq!(ok["filename"], "vzdump-qemu-101-2024_05_01-02_00_00.vma.zst");

        assert!(parse_backup(&json!({"volid": "local:iso/debian.iso", "content": "iso"}), "pve1", "local").is_none());
        assert!(parse_backup(&json!({"volid": "local:backup/manual.tar", "content": "backup"}), "pve1", "local").is_none());
    }

    #[test]
    fn summary_counts_and_recent_window() {
        let now = 1_000_000;
        let backups = vec![
            json!({"type": "qemu", "node": "pve1", "storage": "local", "size": 100, "ctime": now - 60}),
            json!({"type": "lxc", "node": "pve1", "storage": "nfs", "size": 50, "ctime": now - 3600}),
            json!({"type": "qemu", "node": "pve2", "storage": "local", "size": 25, "ctime": now - 30 * 24 * 3600}),
        ];
        let summary = summarize_backups(&backups, now);
        assert_eq!(summary["total"], 3);
        assert_eq!(summary["total_size"], 175);
        assert_eq!(summary["by_type"]["qemu"], 2);
        assert_eq!(summary["by_node"]["pve1"], 2);
        assert_eq!(summary["by_storage"]["local"], 2);
        assert_eq!(summary["recent"].as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn list_walks_backup_storages() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond("list_nodes", json!([{"node": "pve1", "status": "online"}]))
            .respond(
                "list_storage",
                json!([
                    {"storage": "local", "content": "iso,backup,vztmpl"},
                    {"storage": "local-lvm", "content": "images,rootdir"}
                ]),
            )
            .respond(
                "storage_content",
                json!([
                    {"volid": "local:backup/vzdump-qemu-101-a.vma.zst", "content": "backup", "ctime": 1},
                    {"volid": "local:backup/vzdump-lxc-200-b.tar.zst", "content": "backup", "ctime": 2}
                ]),
            );

        let env = d.call_operation("list_backups", &json!({}), "viewer").await;
        let result = env.result.unwrap();
        assert_eq!(result["total"], 2);
        assert_eq!(result["backups"][0]["vmid"], 200);
        assert_eq!(mock.calls("storage_content"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_detects_container_archive() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond("create_guest", json!("UPID:pve1:vzrestore"));

        let env = d
            .call_operation(
                "restore_backup",
                &json!({"node": "pve1", "vmid": 300, "archive": "local:backup/vzdump-lxc-200-x.tar.zst"}),
                "admin",
            )
            .await;
        let result = env.result.unwrap();
        assert_eq!(result["type"], "lxc");
        assert_eq!(result["status"], "started");
        assert_eq!(mock.calls("task_status"), 0);

        let created = mock
            .recorded()
            .into_iter()
            .find(|c| c.label() == "create_guest");
        let Some(RemoteCall::CreateGuest { kind, vmid, .. }) = created else {
            panic!("no restore call recorded");
        };
        assert_eq!(kind, GuestKind::Lxc);
        assert_eq!(vmid, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_cannot_restore() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let env = d
            .call_operation(
                "restore_backup",
                &json!({"node": "pve1", "vmid": 300, "archive": "local:backup/x"}),
                "operator",
            )
            .await;
        assert_eq!(env.error.unwrap().code, "PermissionDenied");
    }
}
