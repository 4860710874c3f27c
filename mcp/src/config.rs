//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PROXMOX_HOST`, `PROXMOX_USERNAME`,
//!    `PROXMOX_PASSWORD`, `SECRET_KEY`, ... (see [`Config::apply_env`])
//! 2. **Config file**: path via `--config <path>`, or `pve-mcp.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [proxmox]
//! host = "pve.example.com"
//! port = 8006
//! username = "root@pam"
//! password = "secret"
//! verify_ssl = false
//! timeout_secs = 30
//!
//! [auth]
//! secret_key = "change-me"
//! algorithm = "HS256"
//! expire_minutes = 60
//! enable_rbac = true
//!
//! [mcp]
//! default_role = "viewer"
//! operation_timeout_secs = 300
//! liveness_interval_secs = 60
//!
//! [server]
//! host = "localhost"
//! port = 8080
//! max_concurrent_operations = 10
//!
//! [ai]
//! enabled = true
//! ollama_host = "http://localhost:11434"
//! model = "llama3.1:8b"
//!
//! [n8n]
//! enabled = false
//! webhook_url = "http://localhost:5678/webhook"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Host, username, password and secret key have no usable default;
//! [`Config::validate`] rejects a configuration without them.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File looked up in the current directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "pve-mcp.toml";

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(name = "pve-mcp", about = "MCP server for Proxmox VE clusters")]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bearer token identifying the caller; its `role` claim selects permissions
    #[arg(long, env = "PVE_MCP_TOKEN")]
    pub token: Option<String>,
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxmox: ConnectionSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub ai: AdvisorConfig,
    #[serde(default)]
    pub n8n: WebhookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxmox VE endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// Hostname or IP of any cluster node. A full `https://...` URL is also
    /// accepted. Override with `PROXMOX_HOST`.
    #[serde(default)]
    pub host: String,
    /// API port (default 8006).
    #[serde(default = "default_port")]
    pub port: u16,
    /// User in `user@realm` form, e.g. `root@pam`.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Verify the server's TLS certificate (default false; PVE ships self-signed).
    #[serde(default)]
    pub verify_ssl: bool,
    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Bearer-token and authorization settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for token signing. Override with `SECRET_KEY`.
    #[serde(default)]
    pub secret_key: String,
    /// `HS256`, `HS384` or `HS512` (default `HS256`).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Token lifetime when the issuer gives none (default 60).
    #[serde(default = "default_expire_minutes")]
    pub expire_minutes: i64,
    /// Enforce role permissions (default true). When false every check passes.
    #[serde(default = "default_true")]
    pub enable_rbac: bool,
}

/// MCP front-end and operation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    /// Role used when no token is presented (default `viewer`).
    #[serde(default = "default_role")]
    pub default_role: String,
    /// Budget for waiting on a remote task, in seconds (default 300).
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Seconds between background connection checks (default 60).
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
}

/// HTTP front-end settings (`pve-gateway`).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind host (default `localhost`). Override with `MCP_SERVER_HOST`.
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Bind port (default 8080). Override with `MCP_SERVER_PORT`.
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Maximum in-flight tool calls (default 10).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,
}

/// Ollama advisory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// n8n webhook settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port() -> u16 {
    8006
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_algorithm() -> String {
    "HS256".to_string()
}
fn default_expire_minutes() -> i64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_role() -> String {
    "viewer".to_string()
}
fn default_operation_timeout() -> u64 {
    300
}
fn default_liveness_interval() -> u64 {
    60
}
fn default_http_host() -> String {
    "localhost".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_max_concurrent() -> usize {
    10
}
fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_webhook_url() -> String {
    "http://localhost:5678/webhook".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            verify_ssl: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            algorithm: default_algorithm(),
            expire_minutes: default_expire_minutes(),
            enable_rbac: true,
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            default_role: default_role(),
            operation_timeout_secs: default_operation_timeout(),
            liveness_interval_secs: default_liveness_interval(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            max_concurrent_operations: default_max_concurrent(),
        }
    }
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ollama_host: default_ollama_host(),
            model: default_ollama_model(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: default_webhook_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConnectionSettings {
    /// API root, e.g. `https://pve.example.com:8006/api2/json`.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/api2/json")
        } else {
            format!("https://{host}:{}/api2/json", self.port)
        }
    }
}

impl HttpConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults,
    /// then validate it.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `pve-mcp.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(&expand_tilde(p))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(v) = lookup("PROXMOX_HOST") {
            self.proxmox.host = v;
        }
        if let Some(v) = lookup("PROXMOX_USERNAME") {
            self.proxmox.username = v;
        }
        if let Some(v) = lookup("PROXMOX_PASSWORD") {
            self.proxmox.password = v;
        }
        if let Some(v) = lookup("PROXMOX_PORT") {
            self.proxmox.port = parse_env("PROXMOX_PORT", &v)?;
        }
        if let Some(v) = lookup("PROXMOX_VERIFY_SSL") {
            self.proxmox.verify_ssl = parse_bool("PROXMOX_VERIFY_SSL", &v)?;
        }
        if let Some(v) = lookup("PROXMOX_TIMEOUT") {
            self.proxmox.timeout_secs = parse_env("PROXMOX_TIMEOUT", &v)?;
        }

        if let Some(v) = lookup("SECRET_KEY") {
            self.auth.secret_key = v;
        }
        if let Some(v) = lookup("JWT_ALGORITHM") {
            self.auth.algorithm = v;
        }
        if let Some(v) = lookup("JWT_EXPIRE_MINUTES") {
            self.auth.expire_minutes = parse_env("JWT_EXPIRE_MINUTES", &v)?;
        }
        if let Some(v) = lookup("ENABLE_RBAC") {
            self.auth.enable_rbac = parse_bool("ENABLE_RBAC", &v)?;
        }

        if let Some(v) = lookup("PVE_MCP_DEFAULT_ROLE") {
            self.mcp.default_role = v;
        }
        if let Some(v) = lookup("OPERATION_TIMEOUT") {
            self.mcp.operation_timeout_secs = parse_env("OPERATION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MCP_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("MCP_SERVER_PORT") {
            self.server.port = parse_env("MCP_SERVER_PORT", &v)?;
        }

        if let Some(v) = lookup("OLLAMA_HOST") {
            self.ai.ollama_host = v;
        }
        if let Some(v) = lookup("OLLAMA_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) = lookup("ENABLE_AI_FEATURES") {
            self.ai.enabled = parse_bool("ENABLE_AI_FEATURES", &v)?;
        }
        if let Some(v) = lookup("N8N_WEBHOOK_URL") {
            self.n8n.webhook_url = v;
        }
        if let Some(v) = lookup("ENABLE_N8N_INTEGRATION") {
            self.n8n.enabled = parse_bool("ENABLE_N8N_INTEGRATION", &v)?;
        }

        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        Ok(())
    }

    /// Reject configurations the gateway cannot start with.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("proxmox.host (PROXMOX_HOST)", &self.proxmox.host),
            ("proxmox.username (PROXMOX_USERNAME)", &self.proxmox.username),
            ("proxmox.password (PROXMOX_PASSWORD)", &self.proxmox.password),
            ("auth.secret_key (SECRET_KEY)", &self.auth.secret_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{name} is required"));
            }
        }
        if !matches!(self.auth.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
            return Err(format!(
                "Unsupported JWT algorithm '{}' (expected HS256, HS384 or HS512)",
                self.auth.algorithm
            ));
        }
        if self.auth.expire_minutes <= 0 {
            return Err("auth.expire_minutes must be positive".into());
        }
        let positive = [
            ("proxmox.timeout_secs", self.proxmox.timeout_secs),
            ("mcp.operation_timeout_secs", self.mcp.operation_timeout_secs),
            ("mcp.liveness_interval_secs", self.mcp.liveness_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(format!("{name} must be positive"));
            }
        }
        if self.server.max_concurrent_operations == 0 {
            return Err("server.max_concurrent_operations must be positive".into());
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("Invalid value for {key} ({value:?}): {e}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("Invalid boolean for {key}: {value:?}")),
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn complete() -> Config {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("PROXMOX_HOST", "pve.lan"),
                ("PROXMOX_USERNAME", "root@pam"),
                ("PROXMOX_PASSWORD", "pw"),
                ("SECRET_KEY", "s3cret"),
            ]))
            .unwrap();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.proxmox.port, 8006);
        assert!(!config.proxmox.verify_ssl);
        assert_eq!(config.proxmox.timeout_secs, 30);
        assert_eq!(config.auth.algorithm, "HS256");
        assert_eq!(config.auth.expire_minutes, 60);
        assert!(config.auth.enable_rbac);
        assert_eq!(config.mcp.default_role, "viewer");
        assert_eq!(config.mcp.operation_timeout_secs, 300);
        assert_eq!(config.server.listen_addr(), "localhost:8080");
        assert!(!config.n8n.enabled);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.contains("PROXMOX_HOST"), "{err}");

        let mut config = complete();
        config.auth.secret_key.clear();
        assert!(config.validate().unwrap_err().contains("SECRET_KEY"));

        assert!(complete().validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = complete();
        config.mcp.liveness_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("mcp.liveness_interval_secs"), "{err}");

        let mut config = complete();
        config.proxmox.timeout_secs = 0;
        assert!(config.validate().unwrap_err().contains("proxmox.timeout_secs"));

        let mut config = complete();
        config.mcp.operation_timeout_secs = 0;
        assert!(config.validate().unwrap_err().contains("mcp.operation_timeout_secs"));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config: Config = toml::from_str(
            r#"
            [proxmox]
            host = "from-file"
            port = 443

            [auth]
            enable_rbac = true
            "#,
        )
        .unwrap();
        assert_eq!(config.proxmox.timeout_secs, 30);

        config
            .apply_env(env(&[
                ("PROXMOX_HOST", "from-env"),
                ("ENABLE_RBAC", "false"),
                ("OPERATION_TIMEOUT", "120"),
            ]))
            .unwrap();
        assert_eq!(config.proxmox.host, "from-env");
        assert_eq!(config.proxmox.port, 443);
        assert!(!config.auth.enable_rbac);
        assert_eq!(config.mcp.operation_timeout_secs, 120);
    }

    #[test]
    fn malformed_env_values_are_errors() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("PROXMOX_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.contains("PROXMOX_PORT"));

        let err = config
            .apply_env(env(&[("ENABLE_RBAC", "maybe")]))
            .unwrap_err();
        assert!(err.contains("ENABLE_RBAC"));
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let mut config = complete();
        config.auth.algorithm = "RS256".into();
        assert!(config.validate().unwrap_err().contains("RS256"));
    }

    #[test]
    fn base_url_from_host_or_url() {
        let mut settings = ConnectionSettings {
            host: "10.0.0.5".into(),
            ..Default::default()
        };
        assert_eq!(settings.base_url(), "https://10.0.0.5:8006/api2/json");

        settings.host = "https://pve.example.com:8443/".into();
        assert_eq!(settings.base_url(), "https://pve.example.com:8443/api2/json");
    }
}
