//! API Middleware
//!
//! Session and account authentication for the tunnel and bearer endpoints.

pub mod auth;

pub use auth::{bearer_token, require_capability, require_session, CapabilityGuard};
