//! Role-based authorization.
//!
//! Three built-in roles map to fixed permission sets. Permissions are
//! `category:action` strings (`vm:start`, `cluster:monitor`, ...). An unknown
//! role has no permissions. When enforcement is disabled every check passes.

const ADMIN: &[&str] = &[
    "vm:create",
    "vm:delete",
    "vm:start",
    "vm:stop",
    "vm:clone",
    "vm:migrate",
    "vm:snapshot",
    "vm:config",
    "vm:monitor",
    "lxc:create",
    "lxc:delete",
    "lxc:start",
    "lxc:stop",
    "lxc:clone",
    "lxc:snapshot",
    "lxc:config",
    "lxc:monitor",
    "lxc:exec",
    "node:monitor",
    "node:configure",
    "node:reboot",
    "node:shutdown",
    "node:services",
    "node:tasks",
    "cluster:monitor",
    "cluster:configure",
    "cluster:ha",
    "cluster:backup",
    "storage:create",
    "storage:delete",
    "storage:configure",
    "storage:monitor",
    "storage:upload",
    "storage:download",
    "network:create",
    "network:delete",
    "network:configure",
    "network:monitor",
    "network:sdn",
    "network:firewall",
    "backup:create",
    "backup:restore",
    "backup:delete",
    "backup:schedule",
    "backup:monitor",
    "system:configure",
    "system:monitor",
    "system:logs",
];

const OPERATOR: &[&str] = &[
    "vm:start",
    "vm:stop",
    "vm:clone",
    "vm:snapshot",
    "vm:monitor",
    "lxc:start",
    "lxc:stop",
    "lxc:clone",
    "lxc:snapshot",
    "lxc:monitor",
    "node:monitor",
    "node:tasks",
    "cluster:monitor",
    "storage:monitor",
    "storage:upload",
    "network:monitor",
    "backup:create",
    "backup:monitor",
    "system:monitor",
];

const VIEWER: &[&str] = &[
    "vm:monitor",
    "lxc:monitor",
    "node:monitor",
    "cluster:monitor",
    "storage:monitor",
    "network:monitor",
    "backup:monitor",
    "system:monitor",
];

pub const ROLES: &[&str] = &["admin", "operator", "viewer"];

/// Permission set of `role`; empty for unknown roles.
pub fn permissions_for(role: &str) -> &'static [&'static str] {
    match role {
        "admin" => ADMIN,
        "operator" => OPERATOR,
        "viewer" => VIEWER,
        _ => &[],
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Authorizer {
    enforce: bool,
}

impl Authorizer {
    pub fn new(enforce: bool) -> Self {
        Self { enforce }
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    pub fn check_permission(&self, role: &str, permission: &str) -> bool {
        !self.enforce || permissions_for(role).contains(&permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_can_only_monitor() {
        let gate = Authorizer::new(true);
        assert!(gate.check_permission("viewer", "vm:monitor"));
        assert!(!gate.check_permission("viewer", "vm:start"));
        assert!(permissions_for("viewer")
            .iter()
            .all(|p| p.ends_with(":monitor")));
    }

    #[test]
    fn operator_starts_but_does_not_create() {
        let gate = Authorizer::new(true);
        assert!(gate.check_permission("operator", "vm:start"));
        assert!(gate.check_permission("operator", "backup:create"));
        assert!(!gate.check_permission("operator", "vm:create"));
        assert!(!gate.check_permission("operator", "backup:restore"));
    }

    #[test]
    fn monitor_sets_are_nested() {
        for p in permissions_for("viewer") {
            assert!(permissions_for("operator").contains(p), "{p}");
            assert!(permissions_for("admin").contains(p), "{p}");
        }
    }

    #[test]
    fn unknown_role_is_denied() {
        let gate = Authorizer::new(true);
        assert!(!gate.check_permission("root", "vm:monitor"));
        assert!(!gate.check_permission("", "vm:monitor"));
        assert!(permissions_for("superuser").is_empty());
    }

    #[test]
    fn disabled_gate_grants_everything() {
        let gate = Authorizer::new(false);
        assert!(gate.check_permission("nobody", "vm:delete"));
        assert!(!gate.is_enforcing());
    }
}
