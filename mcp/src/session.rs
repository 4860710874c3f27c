//! Session lifecycle and bearer tokens.
//!
//! [`SessionManager`] owns the one shared [`PveClient`], wraps its
//! connect/disconnect with logging, and runs a background liveness monitor
//! that reconnects when validation fails.
//!
//! [`TokenIssuer`] signs and verifies HMAC JWTs. Verification failures of any
//! kind (bad signature, expired, malformed) yield `None`; callers treat that
//! as "no identity" and never see the underlying error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::client::PveClient;
use crate::config::AuthConfig;

pub struct SessionManager {
    client: Arc<PveClient>,
    tokens: TokenIssuer,
    monitor_running: Arc<AtomicBool>,
}

/// Clears the running flag when the monitor task ends, and reports a panic.
struct MonitorGuard(Arc<AtomicBool>);

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
        if std::thread::panicking() {
            tracing::error!("Liveness monitor died; the connection will no longer be revalidated");
        } else {
            tracing::debug!("Liveness monitor stopped");
        }
    }
}

impl SessionManager {
    pub fn new(client: Arc<PveClient>, tokens: TokenIssuer) -> Self {
        Self {
            client,
            tokens,
            monitor_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> &Arc<PveClient> {
        &self.client
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub async fn connect(&self) -> bool {
        tracing::info!(endpoint = %self.client.endpoint(), "Connecting to Proxmox VE");
        let connected = self.client.connect().await;
        if !connected {
            tracing::error!(endpoint = %self.client.endpoint(), "Unable to connect to Proxmox VE");
        }
        connected
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    /// Whether a liveness monitor task is currently alive.
    pub fn monitor_running(&self) -> bool {
        self.monitor_running.load(Ordering::SeqCst)
    }

    /// Validate the connection every `interval` (at least one second);
    /// reconnect when it fails.
    pub fn spawn_liveness_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let interval = interval.max(Duration::from_secs(1));
        self.monitor_running.store(true, Ordering::SeqCst);
        let guard = MonitorGuard(Arc::clone(&self.monitor_running));
        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.validate_connection().await {
                    continue;
                }
                tracing::warn!(endpoint = %client.endpoint(), "Connection lost, reconnecting");
                if client.connect().await {
                    tracing::info!(endpoint = %client.endpoint(), "Reconnected to Proxmox VE");
                }
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Clone)]
pub struct TokenIssuer {
    enc: EncodingKey,
    dec: DecodingKey,
    algorithm: Algorithm,
    default_ttl: chrono::Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, algorithm: &str, default_ttl: Duration) -> Result<Self, TokenError> {
        let algorithm = match algorithm {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => return Err(TokenError::UnsupportedAlgorithm(other.to_string())),
        };
        Ok(Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            default_ttl: to_chrono(default_ttl),
        })
    }

    pub fn from_config(auth: &AuthConfig) -> Result<Self, TokenError> {
        let minutes = u64::try_from(auth.expire_minutes).unwrap_or(0);
        Self::new(
            &auth.secret_key,
            &auth.algorithm,
            Duration::from_secs(minutes * 60),
        )
    }

    /// Sign `claims` with an `exp` of now + `ttl` (or the default lifetime).
    pub fn issue(
        &self,
        mut claims: Map<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<String, TokenError> {
        let ttl = ttl.map(to_chrono).unwrap_or(self.default_ttl);
        let exp = (Utc::now() + ttl).timestamp();
        claims.insert("exp".into(), Value::from(exp));
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.enc)?;
        Ok(token)
    }

    /// Claims of a valid, unexpired token; `None` otherwise.
    pub fn verify(&self, token: &str) -> Option<Map<String, Value>> {
        if token.trim().is_empty() {
            return None;
        }
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        match jsonwebtoken::decode::<Map<String, Value>>(token, &self.dec, &validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "Token rejected");
                None
            }
        }
    }

    /// Role carried by a valid token.
    pub fn role_of(&self, token: &str) -> Option<String> {
        let claims = self.verify(token)?;
        caller_role(&claims).map(String::from)
    }
}

/// The `role` claim, if present.
pub fn caller_role(claims: &Map<String, Value>) -> Option<&str> {
    claims.get("role").and_then(Value::as_str)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}
