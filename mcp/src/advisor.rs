//! Advisory text from a local Ollama model.
//!
//! The advisor is best-effort: when disabled it returns a fixed notice, and
//! any failure talking to Ollama is logged and replaced by a fallback string.
//! Callers never see an error from this module.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::AdvisorConfig;

pub const DISABLED_TEXT: &str = "AI features are disabled";
pub const UNAVAILABLE_TEXT: &str = "AI service temporarily unavailable";

/// Usage above this percentage is `Critical`.
pub const CRITICAL_THRESHOLD: f64 = 90.0;
/// Usage above this percentage is `Warning`.
pub const WARNING_THRESHOLD: f64 = 75.0;

pub struct Advisor {
    http: reqwest::Client,
    host: String,
    model: String,
    enabled: bool,
}

impl Advisor {
    pub fn new(config: &AdvisorConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            host: config.ollama_host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            enabled: config.enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(&AdvisorConfig {
            enabled: false,
            ..AdvisorConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `POST {host}/api/generate` with streaming off; returns the `response` text.
    pub async fn complete(&self, prompt: &str) -> String {
        if !self.enabled {
            return DISABLED_TEXT.to_string();
        }
        match self.generate(prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(host = %self.host, model = %self.model, error = %e, "Advisor request failed");
                UNAVAILABLE_TEXT.to_string()
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, String> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let resp = self
            .http
            .post(format!("{}/api/generate", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let value: Value = resp.json().await.map_err(|e| e.to_string())?;
        value["response"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| "response field missing".to_string())
    }
}

/// `Critical` above 90 %, `Warning` above 75 %, else `Good`.
pub fn classify(usage_percent: f64) -> &'static str {
    if usage_percent > CRITICAL_THRESHOLD {
        "Critical"
    } else if usage_percent > WARNING_THRESHOLD {
        "Warning"
    } else {
        "Good"
    }
}

/// Prompt asking for tuning advice on one guest.
pub fn performance_prompt(vmid: u32, name: &str, metrics: &Value) -> String {
    format!(
        "You are a Proxmox VE performance expert. Analyze the following metrics for \
         VM {vmid} ({name}) and give concise, actionable recommendations covering CPU, \
         memory and disk. Metrics:\n{}",
        serde_json::to_string_pretty(metrics).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(10.0), "Good");
        assert_eq!(classify(75.0), "Good");
        assert_eq!(classify(75.1), "Warning");
        assert_eq!(classify(90.0), "Warning");
        assert_eq!(classify(95.0), "Critical");
    }

    #[test]
    fn prompt_embeds_metrics() {
        let prompt = performance_prompt(101, "web", &json!({"cpu_usage_percent": 42.0}));
        assert!(prompt.contains("VM 101 (web)"));
        assert!(prompt.contains("cpu_usage_percent"));
    }

    #[tokio::test]
    async fn disabled_advisor_returns_notice() {
        assert_eq!(Advisor::disabled().complete("hi").await, DISABLED_TEXT);
    }

    #[tokio::test]
    async fn unreachable_service_falls_back() {
        let advisor = Advisor::new(&AdvisorConfig {
            enabled: true,
            ollama_host: "http://127.0.0.1:9".into(),
            model: "test".into(),
        });
        assert_eq!(advisor.complete("hi").await, UNAVAILABLE_TEXT);
    }
}
