//! Gateway error type.
//!
//! Every failure that can cross a component boundary is a [`GatewayError`].
//! Each variant carries a human-readable message (its `Display`), a stable
//! machine-readable [`code`](GatewayError::code), and a structured
//! [`details`](GatewayError::details) map that ends up in the response
//! envelope.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the client, the task poller, and the dispatcher.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The remote endpoint cannot be reached, or no connection is installed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single remote call failed, or answered with an unexpected shape.
    /// Transport failures inside the retry loop surface as
    /// [`GatewayError::OperationFailed`] once retries are exhausted.
    #[error("remote call failed: {0}")]
    Remote(#[from] TransportError),

    /// A remote call exhausted its retries.
    #[error("operation {operation} failed after {attempts} attempts: {last_error}")]
    OperationFailed {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// A task wait exceeded its budget. The remote task keeps running.
    #[error("task {upid} timed out after {timeout_secs} seconds")]
    Timeout { upid: String, timeout_secs: u64 },

    /// Malformed caller input.
    #[error("invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    /// The caller's role lacks the permission an operation requires.
    #[error("role '{role}' lacks permission '{permission}'")]
    PermissionDenied { role: String, permission: String },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("unknown resource URI: {0}")]
    UnknownResource(String),

    #[error("{kind} '{id}' not found")]
    ResourceNotFound { kind: String, id: String },

    /// A handler panicked; the panic was caught at the dispatcher boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a [`GatewayError::Validation`] on `field`.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "ConnectionError",
            Self::Remote(_) => "RemoteError",
            Self::OperationFailed { .. } => "OperationFailed",
            Self::Timeout { .. } => "TimeoutError",
            Self::Validation { .. } => "ValidationError",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::UnknownOperation(_) => "UnknownOperation",
            Self::UnknownResource(_) => "UnknownResource",
            Self::ResourceNotFound { .. } => "ResourceNotFound",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Structured detail map for the envelope. Empty for variants without
    /// extra fields.
    pub fn details(&self) -> Map<String, Value> {
        let value = match self {
            Self::Remote(e) => match e {
                TransportError::Status { status, .. } => json!({ "status": status }),
                _ => json!({}),
            },
            Self::OperationFailed {
                operation,
                attempts,
                ..
            } => json!({ "operation": operation, "attempts": attempts }),
            Self::Timeout { upid, timeout_secs } => {
                json!({ "upid": upid, "timeout": timeout_secs })
            }
            Self::Validation { field, .. } => json!({ "field": field }),
            Self::PermissionDenied { role, permission } => {
                json!({ "role": role, "required_permission": permission })
            }
            Self::UnknownOperation(name) => json!({ "operation": name }),
            Self::UnknownResource(uri) => json!({ "uri": uri }),
            Self::ResourceNotFound { kind, id } => {
                json!({ "resource_type": kind, "resource_id": id })
            }
            Self::Connection(_) | Self::Internal(_) => json!({}),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
