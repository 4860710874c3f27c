//! Fire-and-forget n8n workflow webhooks.
//!
//! `notify("vm-lifecycle", data)` posts `{timestamp, source, data}` to
//! `{webhook_url}/vm-lifecycle` on a background task. Delivery failures are
//! logged at `warn` and otherwise ignored; they never affect the operation
//! that triggered them.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::WebhookConfig;

pub const SOURCE: &str = "pve-mcp";

#[derive(Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    base_url: String,
    enabled: bool,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: config.webhook_url.trim_end_matches('/').to_string(),
            enabled: config.enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(&WebhookConfig::default())
    }

    /// Post `data` to the `name` workflow. Returns the delivery task, or
    /// `None` when webhooks are disabled.
    pub fn notify(&self, name: &str, data: Value) -> Option<JoinHandle<()>> {
        if !self.enabled {
            return None;
        }
        let url = format!("{}/{}", self.base_url, name);
        let body = payload(data);
        let http = self.http.clone();
        let name = name.to_string();

        Some(tokio::spawn(async move {
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(webhook = %name, "Webhook delivered");
                }
                Ok(resp) => {
                    tracing::warn!(webhook = %name, status = %resp.status(), "Webhook rejected");
                }
                Err(e) => {
                    tracing::warn!(webhook = %name, error = %e, "Webhook delivery failed");
                }
            }
        }))
    }
}

/// Request body for a webhook call.
pub fn payload(data: Value) -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "source": SOURCE,
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wraps_data() {
        let body = payload(json!({"vmid": 101}));
        assert_eq!(body["source"], "pve-mcp");
        assert_eq!(body["data"]["vmid"], 101);
        assert!(body["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn disabled_notifier_sends_nothing() {
        assert!(WebhookNotifier::disabled()
            .notify("vm-lifecycle", json!({}))
            .is_none());
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let notifier = WebhookNotifier::new(&WebhookConfig {
            enabled: true,
            webhook_url: "http://127.0.0.1:9/webhook".into(),
        });
        let task = notifier.notify("vm-lifecycle", json!({})).unwrap();
        // The task completes without panicking even though nothing listens
        assert!(task.await.is_ok());
    }
}
