//! # pve-mcp
//!
//! Management gateway that lets AI agents operate a Proxmox VE cluster
//! through named, permission-checked operations.
//!
//! ## Architecture
//!
//! ```text
//! config.rs      TOML file / env-var configuration
//! transport.rs   remote call catalogue, Transport trait, reqwest/ticket transport
//! retry.rs       exponential-backoff retry wrapper
//! client.rs      PveClient: connection lifecycle, liveness, domain accessors
//! tasks.rs       UPID handles and the task poller
//! rbac.rs        role -> permission tables, Authorizer
//! session.rs     SessionManager (liveness monitor), JWT TokenIssuer
//! dispatcher.rs  operation registry, validation, response envelope
//! tools/         operation handlers per resource area
//! resources.rs   read-only proxmox:// resources
//! advisor.rs     advisory text from a local Ollama model
//! webhooks.rs    fire-and-forget workflow notifications
//! mcp.rs         MCP JSON-RPC over stdio
//! mock.rs        scripted Transport for tests
//! ```
//!
//! The `pve-mcp` binary serves MCP on stdio; the `pve-gateway` crate exposes
//! the same [`dispatcher::Dispatcher`] over HTTP.

pub mod advisor;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mcp;
pub mod mock;
pub mod rbac;
pub mod resources;
pub mod retry;
pub mod session;
pub mod tasks;
pub mod tools;
pub mod transport;
pub mod webhooks;

pub use client::PveClient;
pub use config::Config;
pub use dispatcher::{Dispatcher, Envelope, GatewayContext};
pub use error::GatewayError;
