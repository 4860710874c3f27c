//! HTTP route handlers.
//!
//! All handlers except [`health`] require authentication via the
//! [`crate::auth::require_bearer`] middleware.

pub mod health;
pub mod tools;
